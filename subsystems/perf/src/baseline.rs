//! Rolling metric baselines.
//!
//! The baseline is the plain mean of the first `warmup` values, then an
//! exponential moving average. Mean and variance over everything seen are
//! tracked alongside for diagnostics.

/// Baseline of one metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    warmup: u32,
    alpha: f64,
    count: u64,
    mean: f64,
    m2: f64,
    ema: f64,
}

impl Baseline {
    /// Empty baseline
    pub const fn new(warmup: u32, alpha: f64) -> Self {
        Self {
            warmup,
            alpha,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            ema: 0.0,
        }
    }

    /// Fold one value in
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        if self.count <= u64::from(self.warmup) {
            self.ema = self.mean;
        } else {
            self.ema = self.alpha * value + (1.0 - self.alpha) * self.ema;
        }
    }

    /// Values folded in
    #[inline]
    pub fn samples(&self) -> u64 {
        self.count
    }

    /// Warm-up complete
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.count >= u64::from(self.warmup.max(1))
    }

    /// Baseline value once warm
    pub fn value(&self) -> Option<f64> {
        self.is_ready().then_some(self.ema)
    }

    /// Mean over all values
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation over all values
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        libm::sqrt(self.m2 / self.count as f64)
    }

    /// How far `current` is from the baseline in the bad direction, in
    /// percent of the baseline; negative when better
    pub fn deviation_percent(&self, current: f64, higher_is_worse: bool) -> Option<f64> {
        let base = self.value()?;
        if libm::fabs(base) < f64::EPSILON {
            return Some(0.0);
        }
        let change = (current - base) / libm::fabs(base) * 100.0;
        Some(if higher_is_worse { change } else { -change })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_is_plain_mean() {
        let mut b = Baseline::new(4, 0.5);
        for v in [10.0, 20.0, 30.0] {
            b.update(v);
            assert!(b.value().is_none());
        }
        b.update(40.0);
        assert_eq!(b.value(), Some(25.0));
        b.update(45.0);
        assert_eq!(b.value(), Some(35.0));
    }

    #[test]
    fn test_std_dev() {
        let mut b = Baseline::new(1, 0.1);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            b.update(v);
        }
        assert_eq!(b.mean(), 5.0);
        assert!((b.std_dev() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_deviation_direction() {
        let mut b = Baseline::new(1, 0.1);
        b.update(50.0);
        assert_eq!(b.deviation_percent(60.0, true), Some(20.0));
        assert_eq!(b.deviation_percent(40.0, false), Some(20.0));
        assert_eq!(b.deviation_percent(60.0, false), Some(-20.0));

        let mut zero = Baseline::new(1, 0.1);
        zero.update(0.0);
        assert_eq!(zero.deviation_percent(5.0, true), Some(0.0));
    }
}
