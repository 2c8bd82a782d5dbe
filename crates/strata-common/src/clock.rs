//! Wall-clock timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current UTC time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_nanos_is_monotonic_enough() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
