//! Loss scaling.
//!
//! The coordinator consumes loss scaling as an external service: it asks for the
//! current scale to unscale reduced gradients, asks whether a gradient overflowed,
//! and reports the agreed overflow verdict back. The reduction itself always
//! happens; only the optimizer step is skipped on overflow.

use crate::tensor::Tensor;
use tracing::debug;

/// The loss-scaling service.
pub trait LossScaler {
    /// Factor the loss was multiplied by before backward.
    fn loss_scale(&self) -> f32;

    /// Whether an unscaled gradient carries an overflow.
    fn found_overflow(&self, grad: &Tensor) -> bool {
        grad.has_non_finite()
    }

    /// Records the outcome of an iteration once every rank agrees on it.
    fn update(&mut self, found_overflow: bool);
}

/// A fixed loss scale. Overflowed steps are still skipped.
#[derive(Debug, Clone, Copy)]
pub struct StaticLossScaler {
    scale: f32,
}

impl StaticLossScaler {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl LossScaler for StaticLossScaler {
    fn loss_scale(&self) -> f32 {
        self.scale
    }

    fn update(&mut self, _found_overflow: bool) {}
}

/// Dynamic loss scaler.
///
/// Halves the scale on overflow (down to `min_scale`) and doubles it after
/// `growth_interval` consecutive clean steps.
#[derive(Debug, Clone)]
pub struct DynamicLossScaler {
    current_scale: f32,
    growth_interval: u64,
    growth_factor: f32,
    backoff_factor: f32,
    min_scale: f32,
    steps_since_last_overflow: u64,
    overflow_count: u64,
}

impl DynamicLossScaler {
    pub fn new(initial_scale: f32) -> Self {
        Self {
            current_scale: initial_scale,
            growth_interval: 2000,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            min_scale: 1.0,
            steps_since_last_overflow: 0,
            overflow_count: 0,
        }
    }

    pub fn with_growth_interval(mut self, n: u64) -> Self {
        self.growth_interval = n;
        self
    }

    pub fn with_min_scale(mut self, s: f32) -> Self {
        self.min_scale = s;
        self
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }
}

impl LossScaler for DynamicLossScaler {
    fn loss_scale(&self) -> f32 {
        self.current_scale
    }

    fn update(&mut self, found_overflow: bool) {
        if found_overflow {
            self.overflow_count += 1;
            self.steps_since_last_overflow = 0;
            self.current_scale = (self.current_scale * self.backoff_factor).max(self.min_scale);
            debug!(scale = self.current_scale, "loss scale backed off after overflow");
            return;
        }
        self.steps_since_last_overflow += 1;
        if self.steps_since_last_overflow >= self.growth_interval {
            self.current_scale *= self.growth_factor;
            self.steps_since_last_overflow = 0;
            debug!(scale = self.current_scale, "loss scale grown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_scaler_never_changes() {
        let mut s = StaticLossScaler::new(16.0);
        s.update(true);
        s.update(false);
        assert_eq!(s.loss_scale(), 16.0);
    }

    #[test]
    fn test_default_overflow_detection() {
        let s = StaticLossScaler::new(1.0);
        let ok = Tensor::new(vec![1.0, -2.0], vec![2]).unwrap();
        let bad = Tensor::new(vec![1.0, f32::INFINITY], vec![2]).unwrap();
        assert!(!s.found_overflow(&ok));
        assert!(s.found_overflow(&bad));
    }

    #[test]
    fn test_dynamic_scaler_backoff_and_growth() {
        let mut s = DynamicLossScaler::new(8.0).with_growth_interval(2).with_min_scale(2.0);
        s.update(true);
        assert_eq!(s.loss_scale(), 4.0);
        s.update(true);
        s.update(true);
        assert_eq!(s.loss_scale(), 2.0);
        assert_eq!(s.overflow_count(), 3);
        s.update(false);
        s.update(false);
        assert_eq!(s.loss_scale(), 4.0);
    }
}
