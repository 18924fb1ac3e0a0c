//! Exponential Smoothing for Noisy Channels

/// Exponentially weighted moving average
#[derive(Debug, Clone)]
pub struct ExponentialFilter {
    alpha: f64,
    state: Option<f64>,
}

impl ExponentialFilter {
    /// Create a filter with the given weight for new samples.
    ///
    /// `alpha` is clamped to (0, 1]; 1 passes samples through unchanged.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        Self { alpha, state: None }
    }

    /// Add a sample and get the filtered output
    pub fn filter(&mut self, value: f64) -> f64 {
        let next = match self.state {
            // First sample seeds the average
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.state = Some(next);
        next
    }

    /// Forget the running average
    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_passes_through() {
        let mut filter = ExponentialFilter::new(0.25);
        assert_eq!(filter.filter(80.0), 80.0);
    }

    #[test]
    fn test_weighted_average() {
        let mut filter = ExponentialFilter::new(0.5);
        filter.filter(10.0);
        assert!((filter.filter(20.0) - 15.0).abs() < 1e-9);
        assert!((filter.filter(20.0) - 17.5).abs() < 1e-9);
    }

    #[test]
    fn test_damps_spike() {
        let mut filter = ExponentialFilter::new(0.2);
        for _ in 0..10 {
            filter.filter(50.0);
        }
        let result = filter.filter(250.0);
        assert!(result < 100.0);
    }

    #[test]
    fn test_reset() {
        let mut filter = ExponentialFilter::new(0.1);
        filter.filter(100.0);
        filter.reset();
        assert_eq!(filter.filter(5.0), 5.0);
    }
}
