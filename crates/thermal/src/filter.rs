//! Single-pole low-pass filtering for noisy sensor streams.

use num_traits::Float;

/// Simple infinite-impulse-response low-pass filter:
/// `y += (x - y) * dt / (RC + dt)`.
///
/// Higher `rc` means a lower cutoff frequency and more aggressive smoothing.
/// The first sample initializes the state directly, so a heater that starts
/// warm is not reported as freezing while the filter charges.
#[derive(Debug, Clone, Copy)]
pub struct LowPassFilter<F: Float> {
    rc: F,
    state: Option<F>,
}

impl<F: Float> LowPassFilter<F> {
    pub fn new(rc: F) -> Self {
        Self { rc, state: None }
    }

    pub fn feed(&mut self, sample: F, dt: F) -> F {
        let next = match self.state {
            None => sample,
            Some(current) => current + (sample - current) * dt / (self.rc + dt),
        };
        self.state = Some(next);
        next
    }

    pub fn value(&self) -> Option<F> {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn first_sample_passes_through() {
        let mut filter = LowPassFilter::new(4.0);
        assert_approx_eq!(f64, filter.feed(37.5, 1.0), 37.5);
    }

    #[test]
    fn step_response_converges() {
        let mut filter = LowPassFilter::new(2.0);
        filter.feed(0.0, 1.0);
        let mut last = 0.0;
        for _ in 0..100 {
            last = filter.feed(10.0, 1.0);
        }
        assert!((last - 10.0).abs() < 1e-9);
    }

    #[test]
    fn larger_rc_smooths_harder() {
        let mut gentle = LowPassFilter::new(1.0);
        let mut aggressive = LowPassFilter::new(10.0);
        gentle.feed(0.0, 1.0);
        aggressive.feed(0.0, 1.0);
        let g = gentle.feed(10.0, 1.0);
        let a = aggressive.feed(10.0, 1.0);
        assert!(a < g);
    }
}
