// src/stats.rs

/// The `index`-th percentile of `values` (0..=100) using linear
/// interpolation between closest ranks: the percentile sits at position
/// `index / 100 * (n - 1)` of the sorted sample. Returns `None` for an
/// empty sample.
pub fn percentile(values: &[f64], index: u8) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let position = f64::from(index.min(100)) / 100.0 * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let fraction = position - lower as f64;
    if lower + 1 >= sorted.len() {
        return Some(sorted[sorted.len() - 1]);
    }
    Some(sorted[lower] + fraction * (sorted[lower + 1] - sorted[lower]))
}

pub fn percentile_ns(values: &[i64], index: u8) -> Option<f64> {
    let as_f64: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    percentile(&as_f64, index)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_median() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 50), Some(3.0));
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = vec![10.0, 20.0];
        // position 0.05 * 1 between the two samples
        assert!((percentile(&values, 5).unwrap() - 10.5).abs() < 1e-12);
        assert_eq!(percentile(&values, 0), Some(10.0));
        assert_eq!(percentile(&values, 100), Some(20.0));
    }

    #[test]
    fn test_percentile_unsorted_input() {
        let values = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        assert_eq!(percentile(&values, 50), Some(3.0));
        assert_eq!(percentile(&values, 100), Some(5.0));
    }

    #[test]
    fn test_percentile_empty_and_singleton() {
        assert_eq!(percentile(&[], 50), None);
        assert_eq!(percentile(&[7.0], 5), Some(7.0));
    }

    #[test]
    fn test_percentile_ns() {
        let times: Vec<i64> = (1..=11).map(|s| s * 1_000_000_000).collect();
        // 50th percentile of 1..=11 seconds is 6 seconds
        assert_eq!(percentile_ns(&times, 50), Some(6.0e9));
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(mean(&[]), None);
    }
}
