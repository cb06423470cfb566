//! Utility functions and helpers
//!
//! Reconnect backoff arithmetic and human-readable formatting.

use std::time::Duration;

/// Format hash rate as a human-readable string
pub fn format_hash_rate(hashes_per_sec: f64) -> String {
    const UNITS: &[&str] = &["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut rate = hashes_per_sec;
    let mut unit_index = 0;

    while rate >= 1000.0 && unit_index < UNITS.len() - 1 {
        rate /= 1000.0;
        unit_index += 1;
    }

    format!("{:.2} {}", rate, UNITS[unit_index])
}

/// Capped exponential backoff: `min(max, 2^attempt * base)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff calculator
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait before reconnect attempt number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hash_rate() {
        assert_eq!(format_hash_rate(100.0), "100.00 H/s");
        assert_eq!(format_hash_rate(1500.0), "1.50 KH/s");
        assert_eq!(format_hash_rate(1000000.0), "1.00 MH/s");
        assert_eq!(format_hash_rate(1500000000.0), "1.50 GH/s");
        assert_eq!(format_hash_rate(2e18), "2000.00 PH/s");
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5));

        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(3200));
        assert_eq!(backoff.delay_for(6), Duration::from_secs(5)); // Capped at max
        assert_eq!(backoff.delay_for(40), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(60));
        let delays: Vec<_> = (0..64).map(|attempt| backoff.delay_for(attempt)).collect();

        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(60)));
    }
}
