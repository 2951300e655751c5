// src/processors/rtsm.rs
//
// Relative Traffic Status Metric in the style of Yoon et al. A traversal's
// (temporal, spatial) mean speed pair is ranked against the per-connection
// threshold point; the normalized city-block distance into the congested
// quadrants becomes the metric.

use crate::storage::{MetricStore, StoreError};

/// Sentinel for "not computable" (no thresholds for the connection yet).
pub const RTSM_UNKNOWN: f32 = -1.0;

/// Quadrants of the (temporal, spatial) mean speed plane relative to the
/// threshold point. Upper/lower splits on the spatial axis, left/right on
/// the temporal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RtsmQuadrant {
    UpperRight,
    UpperLeft,
    LowerLeft,
    LowerRight,
}

fn quadrant(temporal: f64, spatial: f64, thresholds: (f64, f64)) -> RtsmQuadrant {
    let above_temporal = temporal >= thresholds.0;
    let above_spatial = spatial >= thresholds.1;
    match (above_temporal, above_spatial) {
        (true, true) => RtsmQuadrant::UpperRight,
        (false, true) => RtsmQuadrant::UpperLeft,
        (false, false) => RtsmQuadrant::LowerLeft,
        (true, false) => RtsmQuadrant::LowerRight,
    }
}

fn distance_based_metric(temporal: f64, spatial: f64, thresholds: (f64, f64)) -> f64 {
    match quadrant(temporal, spatial, thresholds) {
        RtsmQuadrant::UpperRight => 0.0,
        RtsmQuadrant::UpperLeft => thresholds.0 - temporal,
        RtsmQuadrant::LowerLeft => (thresholds.0 - temporal) + (thresholds.1 - spatial),
        RtsmQuadrant::LowerRight => thresholds.1 - spatial,
    }
}

/// Compute the relative metric for one (temporal, spatial) pair. Returns the
/// -1 sentinel without thresholds, 1 (worst) when either input is itself the
/// -1 "unknown" sentinel, and a value in `[0, 1]` otherwise; larger means
/// worse traffic.
pub fn compute_relative_metric(
    temporal_mean_speed: f64,
    spatial_mean_speed: f64,
    thresholds: Option<(f64, f64)>,
) -> f32 {
    let Some(thresholds) = thresholds else {
        return RTSM_UNKNOWN;
    };
    if temporal_mean_speed == -1.0 || spatial_mean_speed == -1.0 {
        return 1.0;
    }
    let distance = distance_based_metric(temporal_mean_speed, spatial_mean_speed, thresholds);
    (distance / (thresholds.0 + thresholds.1)) as f32
}

/// Recompute the relative metric of every traversal stored this session and
/// write the results back in bulk. Returns the number of rows touched.
pub fn recompute_all(store: &mut MetricStore) -> Result<usize, StoreError> {
    let mut traversals = store.get_traversal_metrics()?;
    for traversal in &mut traversals {
        let thresholds = store.get_thresholds(&traversal.connection_id)?;
        traversal.relative_metric = Some(compute_relative_metric(
            traversal.temporal_mean_speed,
            traversal.spatial_mean_speed,
            thresholds,
        ));
    }
    store.update_traversal_metrics(&traversals)
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: Option<(f64, f64)> = Some((10.0, 20.0));

    #[test]
    fn test_no_thresholds_yields_sentinel() {
        assert_eq!(compute_relative_metric(5.0, 5.0, None), RTSM_UNKNOWN);
    }

    #[test]
    fn test_unknown_inputs_yield_worst() {
        assert_eq!(compute_relative_metric(-1.0, 5.0, THRESHOLDS), 1.0);
        assert_eq!(compute_relative_metric(5.0, -1.0, THRESHOLDS), 1.0);
    }

    #[test]
    fn test_free_flow_is_zero() {
        // both speeds at or above their thresholds
        assert_eq!(compute_relative_metric(10.0, 20.0, THRESHOLDS), 0.0);
        assert_eq!(compute_relative_metric(15.0, 25.0, THRESHOLDS), 0.0);
    }

    #[test]
    fn test_upper_left() {
        // only the temporal speed is below threshold
        let metric = compute_relative_metric(7.0, 25.0, THRESHOLDS);
        assert!((metric - 3.0 / 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_lower_right() {
        // only the spatial speed is below threshold
        let metric = compute_relative_metric(12.0, 14.0, THRESHOLDS);
        assert!((metric - 6.0 / 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_lower_left_adds_both_distances() {
        let metric = compute_relative_metric(7.0, 14.0, THRESHOLDS);
        assert!((metric - 9.0 / 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_total_congestion_is_one() {
        let metric = compute_relative_metric(0.0, 0.0, THRESHOLDS);
        assert!((metric - 1.0).abs() < 1e-6);
    }
}
