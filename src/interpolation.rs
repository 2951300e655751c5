// src/interpolation.rs
//
// Piecewise-linear interpolation over a strictly increasing knot axis.
// Linear (not cubic) on purpose: short connections with few samples make
// higher-order splines unstable.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum InterpolationError {
    #[error("need at least 2 sample points, got {0}")]
    TooFewPoints(usize),
    #[error("mismatched sample lengths: {knots} knots vs {values} values")]
    LengthMismatch { knots: usize, values: usize },
    #[error("knots must be strictly increasing (violation at index {0})")]
    NotStrictlyIncreasing(usize),
    #[error("value {value} outside interpolation range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

/// A piecewise-linear function through `(knots[i], values[i])`, defined on
/// `[knots[0], knots[n-1]]`. Evaluation outside that range is an error.
#[derive(Debug, Clone)]
pub struct LinearInterpolant {
    knots: Vec<f64>,
    values: Vec<f64>,
}

impl LinearInterpolant {
    pub fn new(knots: Vec<f64>, values: Vec<f64>) -> Result<Self, InterpolationError> {
        if knots.len() != values.len() {
            return Err(InterpolationError::LengthMismatch {
                knots: knots.len(),
                values: values.len(),
            });
        }
        if knots.len() < 2 {
            return Err(InterpolationError::TooFewPoints(knots.len()));
        }
        for i in 1..knots.len() {
            if knots[i] <= knots[i - 1] {
                return Err(InterpolationError::NotStrictlyIncreasing(i));
            }
        }
        Ok(Self { knots, values })
    }

    pub fn min_knot(&self) -> f64 {
        self.knots[0]
    }

    pub fn max_knot(&self) -> f64 {
        self.knots[self.knots.len() - 1]
    }

    /// Evaluate the interpolant at `x`.
    pub fn value(&self, x: f64) -> Result<f64, InterpolationError> {
        if x < self.min_knot() || x > self.max_knot() {
            return Err(InterpolationError::OutOfRange {
                value: x,
                min: self.min_knot(),
                max: self.max_knot(),
            });
        }
        // index of the segment [knots[i], knots[i + 1]] containing x
        let upper = self.knots.partition_point(|&k| k < x);
        if upper == 0 {
            return Ok(self.values[0]);
        }
        let i = upper - 1;
        if self.knots[upper.min(self.knots.len() - 1)] == x {
            return Ok(self.values[upper.min(self.values.len() - 1)]);
        }
        let span = self.knots[i + 1] - self.knots[i];
        let ratio = (x - self.knots[i]) / span;
        Ok(self.values[i] + ratio * (self.values[i + 1] - self.values[i]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolates_between_knots() {
        let f = LinearInterpolant::new(vec![0.0, 10.0, 20.0], vec![0.0, 100.0, 0.0]).unwrap();
        assert_eq!(f.value(0.0).unwrap(), 0.0);
        assert_eq!(f.value(5.0).unwrap(), 50.0);
        assert_eq!(f.value(10.0).unwrap(), 100.0);
        assert_eq!(f.value(15.0).unwrap(), 50.0);
        assert_eq!(f.value(20.0).unwrap(), 0.0);
    }

    #[test]
    fn test_negative_knots() {
        let f = LinearInterpolant::new(vec![-25.0, 0.0, 25.0], vec![3.0, 4.0, 5.0]).unwrap();
        assert!((f.value(-12.5).unwrap() - 3.5).abs() < 1e-12);
        assert!((f.value(12.5).unwrap() - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range() {
        let f = LinearInterpolant::new(vec![0.0, 10.0], vec![0.0, 1.0]).unwrap();
        assert!(matches!(
            f.value(10.001),
            Err(InterpolationError::OutOfRange { .. })
        ));
        assert!(matches!(
            f.value(-0.001),
            Err(InterpolationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(
            LinearInterpolant::new(vec![0.0], vec![1.0]).unwrap_err(),
            InterpolationError::TooFewPoints(1)
        );
        assert_eq!(
            LinearInterpolant::new(vec![0.0, 1.0], vec![1.0]).unwrap_err(),
            InterpolationError::LengthMismatch { knots: 2, values: 1 }
        );
        assert_eq!(
            LinearInterpolant::new(vec![0.0, 1.0, 1.0], vec![1.0, 2.0, 3.0]).unwrap_err(),
            InterpolationError::NotStrictlyIncreasing(2)
        );
    }
}
