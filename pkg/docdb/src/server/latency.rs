//! Exponentially-smoothed latency estimate, α = 2/1001.

use std::sync::Mutex;
use std::time::Duration;

const ALPHA: f64 = 2.0 / 1001.0;

/// A running EMA of request latency in milliseconds. The first sample
/// bootstraps the estimate rather than being blended against a sentinel.
pub struct LatencyEstimate {
    ema_ms: Mutex<Option<f64>>,
}

impl LatencyEstimate {
    pub fn new() -> Self {
        Self {
            ema_ms: Mutex::new(None),
        }
    }

    pub fn sample(&self, elapsed: Duration) {
        let sample_ms = elapsed.as_nanos() as f64 / 1_000_000.0;
        let mut guard = self.ema_ms.lock().unwrap();
        *guard = Some(match *guard {
            None => sample_ms,
            Some(prev) => ALPHA * sample_ms + (1.0 - ALPHA) * prev,
        });
    }

    /// `None` until the first sample has been recorded ("unknown-max").
    pub fn value_ms(&self) -> Option<f64> {
        *self.ema_ms.lock().unwrap()
    }
}

impl Default for LatencyEstimate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_bootstraps_the_estimate() {
        let latency = LatencyEstimate::new();
        assert_eq!(latency.value_ms(), None);
        latency.sample(Duration::from_millis(10));
        assert_eq!(latency.value_ms(), Some(10.0));
    }

    #[test]
    fn later_samples_follow_the_recursive_formula() {
        let latency = LatencyEstimate::new();
        latency.sample(Duration::from_millis(10));
        latency.sample(Duration::from_millis(20));

        let alpha = 2.0 / 1001.0;
        let expected = alpha * 20.0 + (1.0 - alpha) * 10.0;
        assert!((latency.value_ms().unwrap() - expected).abs() < 1e-9);
    }
}
