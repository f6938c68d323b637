//! Linear trend prediction.

use crate::sample::Metric;

/// Extrapolated metric value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Metric
    pub metric: Metric,
    /// Expected value at the horizon
    pub value: f64,
    /// Trend per second
    pub slope_per_sec: f64,
    /// Fit quality, 0..=1
    pub r_squared: f64,
    /// Time the value is predicted for
    pub at_ns: u64,
}

/// Least-squares line through `(timestamp_ns, value)` points, evaluated
/// `horizon_ns` after the newest point
///
/// Needs two distinct timestamps.
pub fn linear_trend(metric: Metric, points: &[(u64, f64)], horizon_ns: u64) -> Option<Prediction> {
    let origin = points.iter().map(|p| p.0).min()?;
    let newest = points.iter().map(|p| p.0).max()?;
    if newest == origin {
        return None;
    }

    let secs = |t: u64| (t - origin) as f64 / 1e9;
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| secs(p.0)).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for &(t, y) in points {
        let dx = secs(t) - mean_x;
        let dy = y - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 { 1.0 } else { (sxy * sxy) / (sxx * syy) };

    let at_ns = newest.saturating_add(horizon_ns);
    Some(Prediction {
        metric,
        value: intercept + slope * secs(at_ns),
        slope_per_sec: slope,
        r_squared: r_squared.clamp(0.0, 1.0),
        at_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_exact_line() {
        let pts = [(0, 10.0), (SEC, 12.0), (2 * SEC, 14.0), (3 * SEC, 16.0)];
        let p = linear_trend(Metric::Temperature, &pts, 2 * SEC).unwrap();
        assert!((p.slope_per_sec - 2.0).abs() < 1e-9);
        assert!((p.value - 20.0).abs() < 1e-9);
        assert!((p.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(p.at_ns, 5 * SEC);
    }

    #[test]
    fn test_flat_and_degenerate() {
        let flat = [(0, 5.0), (SEC, 5.0)];
        let p = linear_trend(Metric::Utilization, &flat, SEC).unwrap();
        assert_eq!(p.slope_per_sec, 0.0);
        assert_eq!(p.value, 5.0);

        assert!(linear_trend(Metric::Utilization, &[], SEC).is_none());
        assert!(linear_trend(Metric::Utilization, &[(7, 1.0), (7, 3.0)], SEC).is_none());
    }

    #[test]
    fn test_noise_lowers_fit() {
        let pts = [(0, 10.0), (SEC, 30.0), (2 * SEC, 5.0), (3 * SEC, 40.0), (4 * SEC, 12.0)];
        let p = linear_trend(Metric::Utilization, &pts, SEC).unwrap();
        assert!(p.r_squared < 0.5);
    }
}
