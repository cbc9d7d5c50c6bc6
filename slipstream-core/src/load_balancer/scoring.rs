//! Lock-free running latency mean.
//!
//! Tracks the mean latency of completed requests per node. Stored as bits
//! of an f64 to allow lock-free atomic updates from concurrent dispatch
//! completions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Count-weighted running mean of observed latencies.
#[derive(Debug)]
pub struct RunningMean {
    /// The current mean, stored as f64 bits for atomic CAS updates.
    mean_bits: AtomicU64,
}

impl RunningMean {
    /// Creates a mean with no samples yet.
    pub fn new() -> Self {
        Self::from_value(0.0)
    }

    /// Creates a mean seeded from a persisted value.
    pub fn from_value(mean_ms: f64) -> Self {
        Self {
            mean_bits: AtomicU64::new(mean_ms.to_bits()),
        }
    }

    /// Reads the current mean in milliseconds.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.mean_bits.load(Ordering::Acquire))
    }

    /// Folds a new latency sample into the mean.
    ///
    /// `sample_count` is the number of samples including this one, so the
    /// update is `(mean * (n - 1) + latest) / n`.
    pub fn observe(&self, latest_ms: f64, sample_count: u64) {
        let n = sample_count.max(1) as f64;
        let mut current_bits = self.mean_bits.load(Ordering::Acquire);

        loop {
            let current = f64::from_bits(current_bits);
            let next = (current * (n - 1.0) + latest_ms) / n;

            // CAS loop to ensure thread-safe lock-free updates
            match self.mean_bits.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(updated_bits) => current_bits = updated_bits,
            }
        }
    }
}

impl Default for RunningMean {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_follows_count_weighted_formula() {
        let mean = RunningMean::new();
        mean.observe(10.0, 1);
        assert_eq!(mean.value(), 10.0);
        mean.observe(20.0, 2);
        assert_eq!(mean.value(), 15.0);
        mean.observe(30.0, 3);
        assert_eq!(mean.value(), 20.0);
    }

    #[test]
    fn seeded_mean_keeps_persisted_value() {
        let mean = RunningMean::from_value(123.5);
        assert_eq!(mean.value(), 123.5);
    }
}
