// src/replay.rs
//
// Drives the kernel from a recorded FCD trace: JSON lines, one update per
// line, in nondecreasing transmission time. Stands in for the simulation
// framework that would normally deliver the messages.

use crate::kernel::FcdKernel;
use crate::types::{FcdRecord, FcdUpdate};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use tracing::{info, warn};

/// One line of the trace file.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceUpdate {
    pub vehicle_id: String,
    pub time_ns: i64,
    #[serde(default)]
    pub is_final: bool,
    pub records: Vec<FcdRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayStats {
    pub updates: u64,
    pub records: u64,
    pub skipped_lines: u64,
    /// Transmission time of the last replayed update.
    pub last_time_ns: i64,
}

/// Replay a trace file through the kernel, advancing simulated time to each
/// update's transmission time before delivering it. Unparsable lines are
/// counted and skipped.
pub fn replay_trace(path: impl AsRef<Path>, kernel: &mut FcdKernel) -> Result<ReplayStats> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open FCD trace {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut stats = ReplayStats::default();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read FCD trace {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let trace_update: TraceUpdate = match serde_json::from_str(&line) {
            Ok(update) => update,
            Err(err) => {
                warn!("skipping malformed trace line {}: {}", line_number + 1, err);
                stats.skipped_lines += 1;
                continue;
            }
        };

        let update = FcdUpdate::new(
            trace_update.time_ns,
            trace_update.is_final,
            trace_update.records,
        );
        kernel.advance_to(update.time_ns);
        stats.updates += 1;
        stats.records += update.records.len() as u64;
        stats.last_time_ns = stats.last_time_ns.max(update.time_ns);
        kernel.process_update(&trace_update.vehicle_id, &update);

        if stats.updates % 10_000 == 0 {
            info!(
                "replayed {} updates ({} records, {} vehicles tracked)",
                stats.updates,
                stats.records,
                kernel.tracked_vehicle_count()
            );
        }
    }
    Ok(stats)
}
