//! Utility functions and helpers
//!
//! Backoff and human-readable formatting used by the workers and the CLI.

use std::time::Duration;

/// Format a search speed as a human-readable string
pub fn format_speed(keys_per_sec: f64) -> String {
    const UNITS: &[&str] = &["keys/s", "Kkeys/s", "Mkeys/s", "Gkeys/s"];
    let mut rate = keys_per_sec.max(0.0);
    let mut unit_index = 0;

    while rate >= 1000.0 && unit_index < UNITS.len() - 1 {
        rate /= 1000.0;
        unit_index += 1;
    }

    format!("{:.2} {}", rate, UNITS[unit_index])
}

/// Format a count with thousands separators
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Expected time until a match at `keys_per_sec`, if the speed is known
pub fn estimate_time_to_match(expected_attempts: f64, keys_per_sec: f64) -> Option<Duration> {
    if keys_per_sec <= 0.0 || !expected_attempts.is_finite() {
        return None;
    }
    let secs = expected_attempts / keys_per_sec;
    if !secs.is_finite() || secs > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_secs(secs.ceil() as u64))
}

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff calculator
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            current_attempt: 0,
        }
    }

    /// Get the next delay
    pub fn next_delay(&mut self) -> Duration {
        let delay_ms = if self.current_attempt == 0 {
            self.initial_delay_ms
        } else {
            let exponential_delay = (self.initial_delay_ms as f64
                * self.multiplier.powi(self.current_attempt as i32))
                as u64;
            std::cmp::min(exponential_delay, self.max_delay_ms)
        };

        self.current_attempt = self.current_attempt.saturating_add(1);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(100.0), "100.00 keys/s");
        assert_eq!(format_speed(1500.0), "1.50 Kkeys/s");
        assert_eq!(format_speed(2_000_000.0), "2.00 Mkeys/s");
        assert_eq!(format_speed(-5.0), "0.00 keys/s");
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn test_estimate_time_to_match() {
        assert_eq!(
            estimate_time_to_match(1024.0, 512.0),
            Some(Duration::from_secs(2))
        );
        assert_eq!(estimate_time_to_match(1024.0, 0.0), None);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(10, 500, 2.0);

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(80));
        assert_eq!(backoff.next_delay(), Duration::from_millis(160));
        assert_eq!(backoff.next_delay(), Duration::from_millis(320));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500)); // Capped at max

        assert_eq!(backoff.attempt(), 7);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10)); // Back to initial
    }
}
