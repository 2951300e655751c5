// src/processors/threshold.rs
//
// Periodic recomputation of the per-connection temporal and spatial
// thresholds that anchor the relative traffic status metric. Thresholds
// follow Yoon et al.: the 5th percentile of traversal times (plus a
// red-light compensation on signalized segments) sets the temporal
// threshold, and the 5th percentile of spatial mean speeds among
// free-flowing traversals sets the spatial one.

use crate::processors::{rtsm, ProcessorContext};
use crate::stats;
use crate::storage::StoreError;
use crate::types::{FcdUpdate, SECOND_NS};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, info};

/// Percentile anchoring both thresholds.
const THRESHOLD_PERCENTILE: u8 = 5;
/// Upper percentile of the travel time spread used by the red-light
/// heuristic.
const SPREAD_PERCENTILE: u8 = 60;
/// Traversal times at or below this are measurement noise and never enter
/// the percentile computation.
const TRAVERSAL_TIME_NOISE_FLOOR_NS: i64 = 5;
/// Connection sample count window in which the red-light heuristic applies.
const MIN_TRAVERSALS_FOR_RED_LIGHT_HEURISTIC: usize = 10;
const MAX_TRAVERSALS_FOR_RED_LIGHT_HEURISTIC: usize = 400;

pub struct ThresholdProcessor {
    /// Simulated nanoseconds between trigger events.
    pub trigger_interval: i64,
    /// Red phase estimate applied by the heuristic, in nanoseconds.
    default_red_light_duration_ns: i64,
    /// Minimum recorded traversals per connection before thresholds are
    /// computed for it.
    min_traversals_for_threshold: usize,
    /// Rewrite the relative metric of every stored traversal on each
    /// trigger.
    recompute_all_rtsm: bool,
    /// Estimated red light durations per connection. Sticky once set.
    red_light_durations: HashMap<String, i64>,
}

impl ThresholdProcessor {
    pub const IDENTIFIER: &'static str = "ThresholdProcessor";

    pub fn new(
        trigger_interval: i64,
        default_red_light_duration_ns: i64,
        min_traversals_for_threshold: usize,
        recompute_all_rtsm: bool,
    ) -> Self {
        Self {
            trigger_interval,
            default_red_light_duration_ns,
            min_traversals_for_threshold,
            recompute_all_rtsm,
            red_light_durations: HashMap::new(),
        }
    }

    pub fn handle_update(&mut self, _vehicle_id: &str, _update: &FcdUpdate) {}

    pub fn trigger(&mut self, event_time: i64, ctx: &mut ProcessorContext<'_>) {
        let started = Instant::now();
        if let Err(err) = self.compute_thresholds(event_time, ctx) {
            error!("threshold computation failed: {}", err);
            return;
        }
        info!(
            "computed thresholds at {} s in {:.1} ms [interval: {} s, recompute_rtsm: {}]",
            event_time / SECOND_NS,
            started.elapsed().as_secs_f64() * 1e3,
            self.trigger_interval / SECOND_NS,
            self.recompute_all_rtsm
        );
        if self.recompute_all_rtsm {
            self.recompute_rtsm(ctx);
        }
    }

    /// A final recompute (unless one just ran at this very time) followed by
    /// an RTSM rewrite over all traversals.
    pub fn shutdown(
        &mut self,
        shutdown_time: i64,
        previous_trigger_time: i64,
        ctx: &mut ProcessorContext<'_>,
    ) {
        if self.trigger_interval > 0 && previous_trigger_time != shutdown_time {
            self.trigger(shutdown_time, ctx);
        }
        self.recompute_rtsm(ctx);
        self.red_light_durations.clear();
    }

    fn recompute_rtsm(&mut self, ctx: &mut ProcessorContext<'_>) {
        let started = Instant::now();
        match rtsm::recompute_all(ctx.store) {
            Ok(count) => info!(
                "recomputed the relative metric of {} traversals in {:.1} ms",
                count,
                started.elapsed().as_secs_f64() * 1e3
            ),
            Err(err) => error!("relative metric recomputation failed: {}", err),
        }
    }

    fn compute_thresholds(
        &mut self,
        simulation_time: i64,
        ctx: &mut ProcessorContext<'_>,
    ) -> Result<(), StoreError> {
        if self.trigger_interval <= 0 {
            return Ok(());
        }
        let traversal_times = ctx.store.get_traversal_times()?;
        let percentiles = self.traversal_time_percentiles(&traversal_times);
        self.update_red_light_estimates(&traversal_times);

        let mut temporal_thresholds: HashMap<String, f64> = HashMap::new();
        for (connection_id, time_percentile) in percentiles {
            let Some(connection) = ctx.network.connection(&connection_id) else {
                debug!(
                    "connection {} has traversals but is missing from the road network",
                    connection_id
                );
                continue;
            };
            let red_light = self
                .red_light_durations
                .get(&connection_id)
                .copied()
                .unwrap_or(0);
            let threshold_time_s = (time_percentile + red_light as f64) / SECOND_NS as f64;
            temporal_thresholds
                .insert(connection_id, connection.length_by_nodes() / threshold_time_s);
        }

        let mut spatial_thresholds = self.spatial_thresholds(&temporal_thresholds, ctx)?;

        // a connection missing either threshold gets neither
        temporal_thresholds.retain(|connection_id, _| spatial_thresholds.contains_key(connection_id));
        spatial_thresholds.retain(|connection_id, _| temporal_thresholds.contains_key(connection_id));

        ctx.store
            .insert_thresholds(&temporal_thresholds, &spatial_thresholds, simulation_time)?;
        Ok(())
    }

    /// 5th percentile of traversal times per connection with enough samples,
    /// after dropping noise-floor times. Connections whose filtered list is
    /// empty get no percentile this round.
    fn traversal_time_percentiles(
        &self,
        traversal_times: &HashMap<String, Vec<i64>>,
    ) -> HashMap<String, f64> {
        let mut percentiles = HashMap::new();
        for (connection_id, times) in traversal_times {
            if times.len() < self.min_traversals_for_threshold {
                continue;
            }
            let filtered: Vec<i64> = times
                .iter()
                .copied()
                .filter(|&t| t > TRAVERSAL_TIME_NOISE_FLOOR_NS)
                .collect();
            if let Some(percentile) = stats::percentile_ns(&filtered, THRESHOLD_PERCENTILE) {
                percentiles.insert(connection_id.clone(), percentile);
            }
        }
        percentiles
    }

    /// Estimate red light durations: a connection with a moderate sample
    /// count whose travel time spread (60th vs 5th percentile) lies between
    /// one and three default red phases is assumed to carry a signal.
    fn update_red_light_estimates(&mut self, traversal_times: &HashMap<String, Vec<i64>>) {
        for (connection_id, times) in traversal_times {
            if times.len() < MIN_TRAVERSALS_FOR_RED_LIGHT_HEURISTIC
                || times.len() > MAX_TRAVERSALS_FOR_RED_LIGHT_HEURISTIC
                || self.red_light_durations.contains_key(connection_id)
            {
                continue;
            }
            let (Some(upper), Some(lower)) = (
                stats::percentile_ns(times, SPREAD_PERCENTILE),
                stats::percentile_ns(times, THRESHOLD_PERCENTILE),
            ) else {
                continue;
            };
            let spread = (upper - lower).abs();
            if spread >= self.default_red_light_duration_ns as f64
                && spread <= 3.0 * self.default_red_light_duration_ns as f64
            {
                self.red_light_durations
                    .insert(connection_id.clone(), self.default_red_light_duration_ns);
            }
        }
    }

    /// 5th percentile of spatial mean speeds among the traversals whose
    /// temporal mean reached the temporal threshold.
    fn spatial_thresholds(
        &self,
        temporal_thresholds: &HashMap<String, f64>,
        ctx: &mut ProcessorContext<'_>,
    ) -> Result<HashMap<String, f64>, StoreError> {
        let mean_speeds = ctx.store.get_mean_speeds()?;
        let mut percentiles = HashMap::new();
        for (connection_id, speeds) in mean_speeds {
            if speeds.len() < self.min_traversals_for_threshold {
                continue;
            }
            let Some(&temporal_threshold) = temporal_thresholds.get(&connection_id) else {
                continue;
            };
            let free_flow_speeds: Vec<f64> = speeds
                .iter()
                .filter(|(temporal, _)| *temporal >= temporal_threshold)
                .map(|(_, spatial)| *spatial)
                .collect();
            if let Some(percentile) = stats::percentile(&free_flow_speeds, THRESHOLD_PERCENTILE) {
                percentiles.insert(connection_id, percentile);
            }
        }
        Ok(percentiles)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road_network::{RoadConnection, RoadNetwork};
    use crate::storage::{MetricStore, StorageBackend};
    use crate::types::GeoPosition;

    fn position_at(meters: f64) -> GeoPosition {
        GeoPosition::new((meters / 6_371_000.0).to_degrees(), 0.0)
    }

    fn test_network() -> RoadNetwork {
        let mut connections = HashMap::new();
        connections.insert(
            "conn_b".to_string(),
            RoadConnection {
                nodes: vec![position_at(0.0), position_at(100.0)],
                max_speed: 33.0,
            },
        );
        RoadNetwork { connections }
    }

    fn store(network: &RoadNetwork) -> MetricStore {
        MetricStore::open("unused.sqlite", StorageBackend::InMemory, network, false).unwrap()
    }

    fn processor() -> ThresholdProcessor {
        ThresholdProcessor::new(30 * 60 * SECOND_NS, 45 * SECOND_NS, 10, false)
    }

    /// Insert one 100 m traversal of conn_b at a constant `speed` m/s.
    fn insert_traversal(store: &mut MetricStore, vehicle: &str, speed: f64) {
        let traversal_time_ns = (100.0 / speed * SECOND_NS as f64) as i64;
        store
            .insert_traversal_metric(
                vehicle,
                traversal_time_ns,
                "conn_b",
                "conn_c",
                speed,
                speed,
                speed,
                -1.0,
                traversal_time_ns,
            )
            .unwrap();
    }

    #[test]
    fn test_insufficient_data_produces_no_thresholds() {
        let network = test_network();
        let mut store = store(&network);
        insert_traversal(&mut store, "veh_0", 25.0);

        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        processor().trigger(1_000, &mut ctx);

        assert!(!ctx.store.got_threshold_for("conn_b"));
        assert_eq!(ctx.store.get_thresholds("conn_b").unwrap(), None);
    }

    #[test]
    fn test_sufficient_data_produces_both_thresholds() {
        let network = test_network();
        let mut store = store(&network);
        for (i, speed) in (20..32).enumerate() {
            insert_traversal(&mut store, &format!("veh_{i}"), speed as f64);
        }

        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        processor().trigger(1_000, &mut ctx);

        let (temporal, spatial) = ctx.store.get_thresholds("conn_b").unwrap().unwrap();
        // the 5th percentile of traversal times lies near the fastest run,
        // so the temporal threshold lands just above 30 m/s
        assert!(temporal > 29.0 && temporal < 31.5, "temporal {temporal}");
        // only the fastest traversals pass the temporal filter
        assert!(spatial > 29.0 && spatial <= 31.0, "spatial {spatial}");

        // a mid-pack traversal now ranks in the congested quadrants
        let metric = rtsm::compute_relative_metric(25.0, 25.0, Some((temporal, spatial)));
        assert!(metric > 0.0 && metric <= 1.0, "metric {metric}");
    }

    #[test]
    fn test_trigger_is_idempotent_without_new_data() {
        let network = test_network();
        let mut store = store(&network);
        for (i, speed) in (20..32).enumerate() {
            insert_traversal(&mut store, &format!("veh_{i}"), speed as f64);
        }

        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = processor();
        processor.trigger(1_000, &mut ctx);
        let first = ctx.store.get_thresholds("conn_b").unwrap().unwrap();
        processor.trigger(1_000, &mut ctx);
        let second = ctx.store.get_thresholds("conn_b").unwrap().unwrap();

        assert!((first.0 - second.0).abs() < 1e-9);
        assert!((first.1 - second.1).abs() < 1e-9);
    }

    #[test]
    fn test_noise_floor_filters_all_samples() {
        let network = test_network();
        let mut store = store(&network);
        for i in 0..12 {
            // all traversal times at the noise floor
            store
                .insert_traversal_metric(
                    &format!("veh_{i}"),
                    1_000,
                    "conn_b",
                    "conn_c",
                    25.0,
                    25.0,
                    25.0,
                    -1.0,
                    3,
                )
                .unwrap();
        }
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        processor().trigger(1_000, &mut ctx);
        assert!(!ctx.store.got_threshold_for("conn_b"));
    }

    #[test]
    fn test_red_light_heuristic_extends_threshold_time() {
        let network = test_network();
        let mut store = store(&network);
        // half the vehicles sail through in ~10 s, half dwell a red phase of
        // ~60 s on top; the 60th vs 5th percentile spread falls between one
        // and three default red phases
        for i in 0..6 {
            let time = (10 + i) * SECOND_NS;
            store
                .insert_traversal_metric(
                    &format!("veh_fast_{i}"),
                    time,
                    "conn_b",
                    "conn_c",
                    10.0,
                    10.0,
                    10.0,
                    -1.0,
                    time,
                )
                .unwrap();
        }
        for i in 0..6 {
            let time = (70 + i) * SECOND_NS;
            store
                .insert_traversal_metric(
                    &format!("veh_slow_{i}"),
                    time,
                    "conn_b",
                    "conn_c",
                    1.4,
                    1.4,
                    1.4,
                    -1.0,
                    time,
                )
                .unwrap();
        }

        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = processor();
        processor.trigger(1_000, &mut ctx);

        assert_eq!(
            processor.red_light_durations.get("conn_b"),
            Some(&(45 * SECOND_NS))
        );
        let (temporal, _) = ctx.store.get_thresholds("conn_b").unwrap().unwrap();
        // without the red light the threshold would be ~100 m / 10.3 s;
        // the added 45 s pushes it well below that
        assert!(temporal < 2.0, "temporal {temporal}");
    }

    #[test]
    fn test_red_light_estimate_is_sticky() {
        let mut processor = processor();
        processor
            .red_light_durations
            .insert("conn_b".to_string(), 45 * SECOND_NS);
        let mut times = HashMap::new();
        // spread far beyond three red phases would normally disqualify
        times.insert(
            "conn_b".to_string(),
            (0..12)
                .map(|i| (10 + i * 60) * SECOND_NS)
                .collect::<Vec<i64>>(),
        );
        processor.update_red_light_estimates(&times);
        assert_eq!(
            processor.red_light_durations.get("conn_b"),
            Some(&(45 * SECOND_NS))
        );
    }

    #[test]
    fn test_shutdown_runs_final_computation_and_rtsm() {
        let network = test_network();
        let mut store = store(&network);
        for (i, speed) in (20..32).enumerate() {
            insert_traversal(&mut store, &format!("veh_{i}"), speed as f64);
        }

        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = processor();
        // no trigger ever fired; shutdown must compute thresholds and then
        // rewrite the relative metric of every stored traversal
        processor.shutdown(9_000, 0, &mut ctx);

        assert!(ctx.store.got_threshold_for("conn_b"));
        let rows = ctx.store.get_traversal_metrics().unwrap();
        assert_eq!(rows.len(), 12);
        for row in rows {
            let metric = row.relative_metric.unwrap();
            assert!((0.0..=1.0).contains(&metric), "metric {metric}");
        }
    }

    #[test]
    fn test_disabled_interval_never_computes() {
        let network = test_network();
        let mut store = store(&network);
        for (i, speed) in (20..32).enumerate() {
            insert_traversal(&mut store, &format!("veh_{i}"), speed as f64);
        }
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = ThresholdProcessor::new(0, 45 * SECOND_NS, 10, false);
        processor.trigger(1_000, &mut ctx);
        assert!(!ctx.store.got_threshold_for("conn_b"));
    }
}
