// src/processors/fcd_writer.rs
//
// Batched raw-record persistence. Buffers the records of every incoming
// update per vehicle and bulk-writes them on each trigger and at shutdown.

use crate::processors::ProcessorContext;
use crate::types::{FcdRecord, FcdUpdate};
use std::collections::HashMap;
use tracing::{error, info};

pub struct FcdWriterProcessor {
    /// Simulated nanoseconds between flushes.
    pub trigger_interval: i64,
    record_buffer: HashMap<String, Vec<FcdRecord>>,
}

impl FcdWriterProcessor {
    pub const IDENTIFIER: &'static str = "FcdWriterProcessor";

    pub fn new(trigger_interval: i64) -> Self {
        Self {
            trigger_interval,
            record_buffer: HashMap::new(),
        }
    }

    pub fn handle_update(&mut self, vehicle_id: &str, update: &FcdUpdate) {
        self.record_buffer
            .entry(vehicle_id.to_string())
            .or_default()
            .extend(update.records.values().cloned());
    }

    pub fn trigger(&mut self, _event_time: i64, ctx: &mut ProcessorContext<'_>) {
        info!(
            "persisting FCD records of {} vehicles",
            self.record_buffer.len()
        );
        self.persist_records(ctx);
    }

    pub fn shutdown(&mut self, _shutdown_time: i64, ctx: &mut ProcessorContext<'_>) {
        info!(
            "final persistence of FCD records of {} vehicles",
            self.record_buffer.len()
        );
        self.persist_records(ctx);
    }

    fn persist_records(&mut self, ctx: &mut ProcessorContext<'_>) {
        match ctx.store.insert_records_bulk(&self.record_buffer) {
            Ok(_) => self.record_buffer.clear(),
            // keep the buffer for the next attempt
            Err(err) => error!("record persistence failed: {}", err),
        }
    }

    pub fn buffered_vehicle_count(&self) -> usize {
        self.record_buffer.len()
    }
}
