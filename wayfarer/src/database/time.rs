//! Timestamp helpers. Timestamps are stored as INTEGER Unix epoch milliseconds (UTC).

use chrono::Utc;
use std::time::Duration;

/// Current time as Unix epoch milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A duration as whole milliseconds, saturating at `i64::MAX`.
#[inline]
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// The epoch-ms instant `age` before `now`.
#[inline]
pub fn ms_ago(now: i64, age: Duration) -> i64 {
    now.saturating_sub(duration_ms(age))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1_500)), 1_500);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }

    #[test]
    fn ms_ago_subtracts() {
        assert_eq!(ms_ago(10_000, Duration::from_secs(3)), 7_000);
        assert_eq!(ms_ago(i64::MIN, Duration::from_secs(1)), i64::MIN);
    }
}
