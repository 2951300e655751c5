// src/processors/spatio_temporal.rs
//
// Turns one completed traversal into mean-speed metrics and persists them.
//
// The traversal records are padded with the last record of the previous
// connection and the first record of the following one, both with offsets
// recomputed geometrically. Two piecewise-linear interpolants over the
// offset axis (time-over-distance and speed-over-distance) yield the
// temporal and spatial mean speeds.

use crate::interpolation::{InterpolationError, LinearInterpolant};
use crate::processors::{rtsm, ProcessorContext};
use crate::road_network::RoadNetwork;
use crate::types::{FcdRecord, FcdTraversal, SECOND_NS};
use tracing::{debug, error};

/// Connection lengths up to this much beyond the last sampled offset are
/// clamped onto it instead of failing the interpolation.
const CONNECTION_LENGTH_TOLERANCE_M: f64 = 5.0;
/// Minimum step between consecutive offsets on the interpolation axis.
const MIN_OFFSET_STEP_M: f64 = 0.001;

pub struct SpatioTemporalProcessor {
    /// Sampling distance for the spatial mean speed, in meters.
    spatial_mean_speed_chunk_m: f64,
}

impl SpatioTemporalProcessor {
    pub fn new(spatial_mean_speed_chunk_m: f64) -> Self {
        Self {
            spatial_mean_speed_chunk_m,
        }
    }

    pub fn on_traversal(
        &mut self,
        vehicle_id: &str,
        traversal: &FcdTraversal,
        ctx: &mut ProcessorContext<'_>,
    ) {
        self.compute_metrics(vehicle_id, traversal, ctx);
    }

    fn compute_metrics(
        &mut self,
        vehicle_id: &str,
        traversal: &FcdTraversal,
        ctx: &mut ProcessorContext<'_>,
    ) {
        let connection_id = traversal.connection_id.as_str();
        let Some(records) = build_interpolation_records(traversal, ctx.network) else {
            return;
        };

        if records.len() < 3 {
            // at least one record on the previous, one on the current, and
            // one on the following connection
            debug!(
                "incomplete traversal for vehicle {} on connection {}: {} records",
                vehicle_id,
                connection_id,
                records.len()
            );
            return;
        }
        if traversal.previous_record.is_none()
            || traversal.following_record.is_none()
            || records[0].connection_id == records[1].connection_id
            || records[1].connection_id == records[records.len() - 1].connection_id
        {
            // normal occurrence at the very first connection of a vehicle's
            // life, where no surrounding context exists yet
            debug!(
                "incomplete traversal for vehicle {} on connection {}",
                vehicle_id, connection_id
            );
            return;
        }

        // strictly monotone offset axis, raising each non-increasing offset
        // at least one millimeter above its predecessor
        let mut offsets = Vec::with_capacity(records.len());
        let mut times = Vec::with_capacity(records.len());
        let mut speeds = Vec::with_capacity(records.len());
        for record in &records {
            let offset = match offsets.last() {
                Some(&previous) => record.offset.max(previous + MIN_OFFSET_STEP_M),
                None => record.offset,
            };
            offsets.push(offset);
            times.push(record.time_ns as f64);
            speeds.push(record.speed);
        }

        let time_over_distance = match LinearInterpolant::new(offsets.clone(), times) {
            Ok(interpolant) => interpolant,
            Err(err) => {
                error!(
                    "time interpolation failed for vehicle {} on connection {}: {}",
                    vehicle_id, connection_id, err
                );
                return;
            }
        };
        let speed_over_distance = match LinearInterpolant::new(offsets, speeds) {
            Ok(interpolant) => interpolant,
            Err(err) => {
                error!(
                    "speed interpolation failed for vehicle {} on connection {}: {}",
                    vehicle_id, connection_id, err
                );
                return;
            }
        };

        let length = traversal_length(connection_id, ctx.network, time_over_distance.max_knot());

        let (time_at_end, time_at_start) = match (
            time_over_distance.value(length),
            time_over_distance.value(0.0),
        ) {
            (Ok(end), Ok(start)) => (end, start),
            (Err(err), _) | (_, Err(err)) => {
                // connection length and the distance actually driven disagree
                // beyond the tolerance
                error!(
                    "traversal of vehicle {} on connection {} not interpolable: {}",
                    vehicle_id, connection_id, err
                );
                return;
            }
        };
        let traversal_time_ns = time_at_end - time_at_start;
        let temporal_mean_speed = (length / traversal_time_ns) * SECOND_NS as f64;

        let spatial_mean_speed = match self.spatial_mean_speed(&records, &speed_over_distance) {
            Ok(speed) => speed,
            Err(err) => {
                error!(
                    "spatial sampling failed for vehicle {} on connection {}: {}",
                    vehicle_id, connection_id, err
                );
                return;
            }
        };
        let naive_mean_speed = naive_mean_speed(&records, connection_id);

        if !traversal_time_ns.is_finite()
            || traversal_time_ns <= 0.0
            || !temporal_mean_speed.is_finite()
            || temporal_mean_speed < 0.0
            || !spatial_mean_speed.is_finite()
            || spatial_mean_speed < 0.0
            || !naive_mean_speed.is_finite()
            || naive_mean_speed < 0.0
        {
            debug!(
                "degenerate metrics for vehicle {} on connection {} dropped",
                vehicle_id, connection_id
            );
            return;
        }

        let relative_metric = if ctx.store.got_threshold_for(connection_id) {
            match ctx.store.get_thresholds(connection_id) {
                Ok(thresholds) => rtsm::compute_relative_metric(
                    temporal_mean_speed,
                    spatial_mean_speed,
                    thresholds,
                ),
                Err(err) => {
                    error!("threshold lookup failed for connection {}: {}", connection_id, err);
                    rtsm::RTSM_UNKNOWN
                }
            }
        } else {
            rtsm::RTSM_UNKNOWN
        };

        let last_record_time = match traversal.records.last() {
            Some(record) => record.time_ns,
            None => return,
        };
        // keep the stored next id non-null even without a following record
        let next_connection_id = traversal
            .following_record
            .as_ref()
            .map(|record| record.connection_id.as_str())
            .unwrap_or(connection_id);

        if let Err(err) = ctx.store.insert_traversal_metric(
            vehicle_id,
            last_record_time,
            connection_id,
            next_connection_id,
            spatial_mean_speed,
            temporal_mean_speed,
            naive_mean_speed,
            relative_metric,
            traversal_time_ns as i64,
        ) {
            error!(
                "traversal metric insertion failed for vehicle {} on connection {}: {}",
                vehicle_id, connection_id, err
            );
            return;
        }
        debug!(
            "metrics for vehicle {} on connection {}: temporal {:.2} spatial {:.2} naive {:.2}",
            vehicle_id, connection_id, temporal_mean_speed, spatial_mean_speed, naive_mean_speed
        );
    }

    /// Average of speed samples at equidistant offsets along the connection.
    /// Connections shorter than one chunk fall back to the arithmetic mean
    /// of the record speeds.
    fn spatial_mean_speed(
        &self,
        records: &[FcdRecord],
        speed_over_distance: &LinearInterpolant,
    ) -> Result<f64, InterpolationError> {
        let mut cursor = records[0].offset.ceil();
        let end = records[records.len() - 1].offset.floor();

        if end - cursor < self.spatial_mean_speed_chunk_m {
            return Ok(records.iter().map(|r| r.speed).sum::<f64>() / records.len() as f64);
        }
        let mut samples = Vec::new();
        while end - cursor >= self.spatial_mean_speed_chunk_m {
            samples.push(speed_over_distance.value(cursor)?);
            cursor += self.spatial_mean_speed_chunk_m;
        }
        Ok(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

/// Pad the traversal records with the previous and following record, their
/// offsets recomputed geometrically: the previous record sits at the negated
/// distance to the connection's start node, the following record one
/// inter-position distance beyond the last on-connection offset. The offsets
/// those records carried are irrelevant here.
fn build_interpolation_records(
    traversal: &FcdTraversal,
    network: &RoadNetwork,
) -> Option<Vec<FcdRecord>> {
    let mut records = Vec::with_capacity(traversal.records.len() + 2);
    if let Some(previous) = &traversal.previous_record {
        let Some(connection) = network.connection(&traversal.connection_id) else {
            error!(
                "connection {} missing from road network",
                traversal.connection_id
            );
            return None;
        };
        let Some(start_node) = connection.start_node() else {
            error!("connection {} has no nodes", traversal.connection_id);
            return None;
        };
        let offset = -previous.position.distance_to(start_node);
        records.push(previous.with_offset(offset));
    }
    records.extend(traversal.records.iter().cloned());
    if let (Some(following), Some(last)) = (&traversal.following_record, traversal.records.last()) {
        let offset = last.offset + last.position.distance_to(&following.position);
        records.push(following.with_offset(offset));
    }
    Some(records)
}

/// Connection length from node geometry, clamped onto the last sampled
/// offset when it overshoots by no more than the tolerance.
fn traversal_length(connection_id: &str, network: &RoadNetwork, max_knot: f64) -> f64 {
    let length = network
        .connection(connection_id)
        .map(|connection| connection.length_by_nodes())
        .unwrap_or(max_knot);
    if length > max_knot && length - CONNECTION_LENGTH_TOLERANCE_M <= max_knot {
        max_knot
    } else {
        length
    }
}

/// Unweighted mean speed over the records lying on the traversed connection,
/// ignoring the padded neighbors.
fn naive_mean_speed(records: &[FcdRecord], connection_id: &str) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for record in records {
        if record.connection_id == connection_id {
            sum += record.speed;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    sum / count as f64
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road_network::RoadConnection;
    use crate::storage::{MetricStore, StorageBackend};
    use crate::types::{GeoPosition, SECOND_NS};
    use std::collections::HashMap;

    fn position_at(meters: f64) -> GeoPosition {
        GeoPosition::new((meters / 6_371_000.0).to_degrees(), 0.0)
    }

    /// Three connections a → b → c laid out along a straight line, 100 m
    /// each.
    fn test_network() -> RoadNetwork {
        let connection = |from: f64, to: f64| RoadConnection {
            nodes: vec![position_at(from), position_at(to)],
            max_speed: 27.78,
        };
        let mut connections = HashMap::new();
        connections.insert("conn_a".to_string(), connection(0.0, 100.0));
        connections.insert("conn_b".to_string(), connection(100.0, 200.0));
        connections.insert("conn_c".to_string(), connection(200.0, 300.0));
        RoadNetwork { connections }
    }

    fn store(network: &RoadNetwork) -> MetricStore {
        MetricStore::open("unused.sqlite", StorageBackend::InMemory, network, false).unwrap()
    }

    /// Record of a vehicle at absolute position `absolute_m` along the line,
    /// on `connection_id` at the given on-connection offset.
    fn record(time_s: i64, connection_id: &str, offset: f64, absolute_m: f64, speed: f64) -> FcdRecord {
        FcdRecord {
            time_ns: time_s * SECOND_NS,
            position: position_at(absolute_m),
            connection_id: connection_id.to_string(),
            speed,
            offset,
            heading: 0.0,
            perceived_vehicles: Vec::new(),
        }
    }

    /// A constant-speed traversal of conn_b at 25 m/s: samples every second
    /// at offsets 0, 25, 50, 75, flanked by the last record on conn_a and
    /// the first on conn_c.
    fn complete_traversal() -> FcdTraversal {
        FcdTraversal {
            connection_id: "conn_b".to_string(),
            records: vec![
                record(4, "conn_b", 0.0, 100.0, 25.0),
                record(5, "conn_b", 25.0, 125.0, 25.0),
                record(6, "conn_b", 50.0, 150.0, 25.0),
                record(7, "conn_b", 75.0, 175.0, 25.0),
            ],
            previous_record: Some(record(3, "conn_a", 75.0, 75.0, 25.0)),
            following_record: Some(record(8, "conn_c", 0.0, 200.0, 25.0)),
        }
    }

    #[test]
    fn test_constant_speed_traversal_metrics() {
        let network = test_network();
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &complete_traversal(), &mut ctx);

        let rows = ctx.store.get_traversal_metrics().unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.connection_id, "conn_b");
        assert!((row.temporal_mean_speed - 25.0).abs() < 0.5, "temporal {}", row.temporal_mean_speed);
        assert!((row.spatial_mean_speed - 25.0).abs() < 0.5, "spatial {}", row.spatial_mean_speed);
        assert_eq!(row.relative_metric, Some(-1.0));
        assert_eq!(row.time_ns, 7 * SECOND_NS);

        let times = ctx.store.get_traversal_times().unwrap();
        assert_eq!(times["conn_b"].len(), 1);
        // 100 m at 25 m/s
        assert!((times["conn_b"][0] - 4 * SECOND_NS).abs() < SECOND_NS / 10);
    }

    #[test]
    fn test_first_traversal_without_previous_record_is_skipped() {
        let network = test_network();
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut traversal = complete_traversal();
        traversal.previous_record = None;

        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &traversal, &mut ctx);
        assert!(ctx.store.get_traversal_metrics().unwrap().is_empty());
    }

    #[test]
    fn test_missing_following_record_is_skipped() {
        let network = test_network();
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut traversal = complete_traversal();
        traversal.following_record = None;

        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &traversal, &mut ctx);
        assert!(ctx.store.get_traversal_metrics().unwrap().is_empty());
    }

    #[test]
    fn test_connection_far_longer_than_sampled_range_produces_no_metric() {
        let mut network = test_network();
        // conn_b claims 300 m while the vehicle only sampled ~100 m of it
        network.connections.insert(
            "conn_b".to_string(),
            RoadConnection {
                nodes: vec![position_at(100.0), position_at(400.0)],
                max_speed: 27.78,
            },
        );
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &complete_traversal(), &mut ctx);
        assert!(ctx.store.get_traversal_metrics().unwrap().is_empty());
    }

    #[test]
    fn test_length_within_tolerance_is_clamped() {
        let mut network = test_network();
        // 3 m longer than the sampled range, within the 5 m tolerance
        network.connections.insert(
            "conn_b".to_string(),
            RoadConnection {
                nodes: vec![position_at(100.0), position_at(203.0)],
                max_speed: 27.78,
            },
        );
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &complete_traversal(), &mut ctx);

        let rows = ctx.store.get_traversal_metrics().unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].temporal_mean_speed - 25.0).abs() < 1.0);
    }

    #[test]
    fn test_short_connection_falls_back_to_arithmetic_mean() {
        let mut network = test_network();
        network.connections.insert(
            "conn_b".to_string(),
            RoadConnection {
                nodes: vec![position_at(100.0), position_at(106.0)],
                max_speed: 27.78,
            },
        );
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let traversal = FcdTraversal {
            connection_id: "conn_b".to_string(),
            records: vec![
                record(4, "conn_b", 0.0, 100.0, 2.0),
                record(5, "conn_b", 3.0, 103.0, 3.0),
                record(6, "conn_b", 6.0, 106.0, 4.0),
            ],
            previous_record: Some(record(3, "conn_a", 98.0, 98.0, 2.0)),
            following_record: Some(record(7, "conn_c", 2.0, 108.0, 4.0)),
        };
        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &traversal, &mut ctx);

        let rows = ctx.store.get_traversal_metrics().unwrap();
        assert_eq!(rows.len(), 1);
        // arithmetic mean over all five speeds: (2 + 2 + 3 + 4 + 4) / 5
        assert!((rows[0].spatial_mean_speed - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_relative_metric_computed_once_thresholds_exist() {
        let network = test_network();
        let mut store = store(&network);
        let mut temporal = HashMap::new();
        let mut spatial = HashMap::new();
        temporal.insert("conn_b".to_string(), 30.0);
        spatial.insert("conn_b".to_string(), 30.0);
        store.insert_thresholds(&temporal, &spatial, 0).unwrap();

        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &complete_traversal(), &mut ctx);

        let rows = ctx.store.get_traversal_metrics().unwrap();
        assert_eq!(rows.len(), 1);
        let metric = rows[0].relative_metric.unwrap();
        // (30 - 25) + (30 - 25) over (30 + 30)
        assert!((metric - 10.0 / 60.0).abs() < 0.02, "metric {metric}");
    }

    #[test]
    fn test_non_monotone_offsets_are_tolerated() {
        let network = test_network();
        let mut store = store(&network);
        let mut ctx = ProcessorContext {
            network: &network,
            store: &mut store,
        };
        let mut traversal = complete_traversal();
        // a stuck odometer reports the same offset twice
        traversal.records[2].offset = 25.0;

        let mut processor = SpatioTemporalProcessor::new(15.0);
        processor.on_traversal("veh_0", &traversal, &mut ctx);
        assert_eq!(ctx.store.get_traversal_metrics().unwrap().len(), 1);
    }
}
