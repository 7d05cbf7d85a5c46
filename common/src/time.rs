//! Time utilities and protocol defaults.

use chrono::{DateTime, TimeZone, Utc};

/// Protocol timing defaults.
pub mod constants {
    use std::time::Duration;

    /// Per-participant prepare budget (1 second).
    pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Attempts per participant for commit and rollback calls.
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

    /// First retry delay (100 milliseconds), doubled on each retry.
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

    /// Upper bound on a single retry delay (5 seconds).
    pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

    /// How long `stop` waits for in-flight phases (30 seconds).
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Current time as milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    now().timestamp_millis()
}

/// Convert milliseconds since the Unix epoch back to a timestamp.
pub fn from_unix_millis(millis: i64) -> Option<Timestamp> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Delay before retry number `retry` (1-based) for an exponential backoff.
pub fn backoff_delay(
    base: std::time::Duration,
    max: std::time::Duration,
    retry: u32,
) -> std::time::Duration {
    let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_millis_round_trip() {
        let millis = unix_millis();
        let ts = from_unix_millis(millis).unwrap();
        assert_eq!(ts.timestamp_millis(), millis);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, max, 3), max);
        assert_eq!(backoff_delay(base, max, 40), max);
    }
}
