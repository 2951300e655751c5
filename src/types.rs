// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One simulated second in nanoseconds.
pub const SECOND_NS: i64 = 1_000_000_000;
/// One simulated minute in nanoseconds.
pub const MINUTE_NS: i64 = 60 * SECOND_NS;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ============================================================================
// Geographic position
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
        }
    }

    /// Great-circle (haversine) distance to another position in meters.
    /// Elevation is ignored.
    pub fn distance_to(&self, other: &GeoPosition) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

// ============================================================================
// FCD record
// ============================================================================

/// Immutable snapshot of one vehicle at one simulated point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcdRecord {
    /// Sampling time in simulated nanoseconds.
    pub time_ns: i64,
    pub position: GeoPosition,
    /// Id of the road connection the vehicle was driving on.
    pub connection_id: String,
    /// Speed in m/s.
    pub speed: f64,
    /// Distance driven along the current connection from its start node, in meters.
    pub offset: f64,
    /// Heading in degrees.
    pub heading: f64,
    /// Ids of vehicles perceived by the sampling vehicle. Opaque to the core.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perceived_vehicles: Vec<String>,
}

impl FcdRecord {
    /// Copy of this record with a replaced offset. Used when a record is
    /// padded onto a neighboring traversal and its offset is recomputed
    /// geometrically.
    pub fn with_offset(&self, offset: f64) -> FcdRecord {
        FcdRecord {
            offset,
            ..self.clone()
        }
    }

    /// Estimated wire size of this record in bytes, used by simulated
    /// communication layers: 4 (time) + 24 (position) + 10 (connection id)
    /// + 8 (speed) + 8 (offset) + 8 (heading), plus ~50 per perceived
    /// vehicle id.
    pub fn record_size_bytes(&self) -> u64 {
        4 + 8 * 3 + 10 + 8 + 8 + 8 + self.perceived_vehicles.len() as u64 * 50
    }
}

// ============================================================================
// Update message
// ============================================================================

/// A batch of records sent by one vehicle, keyed and ordered by record time.
#[derive(Debug, Clone)]
pub struct FcdUpdate {
    /// Transmission time in simulated nanoseconds.
    pub time_ns: i64,
    /// Set when the vehicle will send no further updates.
    pub is_final: bool,
    pub records: BTreeMap<i64, FcdRecord>,
}

impl FcdUpdate {
    pub fn new(time_ns: i64, is_final: bool, records: Vec<FcdRecord>) -> Self {
        Self {
            time_ns,
            is_final,
            records: records.into_iter().map(|r| (r.time_ns, r)).collect(),
        }
    }

    /// Estimated wire size: 10 (header) + 8 (time stamp) + 1 (final flag)
    /// plus the size of every carried record.
    pub fn message_size_bytes(&self) -> u64 {
        10 + 8
            + 1
            + self
                .records
                .values()
                .map(FcdRecord::record_size_bytes)
                .sum::<u64>()
    }
}

// ============================================================================
// Traversal
// ============================================================================

/// A completed traversal of one connection by one vehicle.
///
/// `previous_record` is the last record of the previous connection and
/// `following_record` the first record of the next one; both carry a
/// different connection id than `records` and either may be absent at the
/// edges of a vehicle's lifetime.
#[derive(Debug, Clone)]
pub struct FcdTraversal {
    pub connection_id: String,
    /// Time-ordered records, all sharing `connection_id`.
    pub records: Vec<FcdRecord>,
    pub previous_record: Option<FcdRecord>,
    pub following_record: Option<FcdRecord>,
}

// ============================================================================
// Stored traversal statistics
// ============================================================================

/// One traversal metric row as read back from the metric store.
#[derive(Debug, Clone, Serialize)]
pub struct TraversalStatistics {
    pub connection_id: String,
    /// Store-assigned row id of the traversal.
    pub traversal_id: i64,
    /// Time of the last record of the traversal.
    pub time_ns: i64,
    pub temporal_mean_speed: f64,
    pub spatial_mean_speed: f64,
    /// Relative traffic status metric; -1 when not computable.
    pub relative_metric: Option<f32>,
    /// Temporal mean speed over the connection's maximum allowed speed.
    pub speed_performance_index: Option<f64>,
}

/// Per-connection averages over a time interval.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalAverages {
    pub connection_id: String,
    pub sample_count: i64,
    pub temporal_mean_speed: f64,
    pub spatial_mean_speed: f64,
    pub naive_mean_speed: f64,
    pub traversal_time_ns: f64,
    pub relative_metric: Option<f64>,
    pub speed_performance_index: Option<f64>,
}

// ============================================================================
// Non-update server messages
// ============================================================================

/// Messages other than record updates that units may send to the server.
/// Dispatched to the configured message-based processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TrafficStateQuery {
        connection_id: String,
        time_ns: i64,
    },
}

/// Responses produced by message-based processors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    TrafficState {
        connection_id: String,
        statistics: Option<TraversalStatistics>,
    },
}

// ============================================================================
// TESTS
// ============================================================================
