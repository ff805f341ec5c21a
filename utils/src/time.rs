use std::time::Duration;
#[cfg(not(test))]
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use mock_instant::global::{SystemTime, UNIX_EPOCH};

/// Get the elapsed system time since the Unix Epoch in Milliseconds
pub fn get_epoch_time_in_ms() -> u64 {
    get_epoch_time().as_millis() as u64
}

/// Get the elapsed system time since the Unix Epoch in Seconds
pub fn get_epoch_time_in_secs() -> u64 {
    get_epoch_time().as_secs()
}

fn get_epoch_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use mock_instant::global::MockClock;

    use super::*;

    #[test]
    fn test_get_epoch_time_granularity() {
        MockClock::set_system_time(Duration::from_millis(1_700_000_123_456));

        assert_eq!(get_epoch_time_in_ms(), 1_700_000_123_456);
        // Seconds truncate the sub-second part.
        assert_eq!(get_epoch_time_in_secs(), 1_700_000_123);

        MockClock::advance_system_time(Duration::from_millis(544));
        assert_eq!(get_epoch_time_in_secs(), 1_700_000_124);
    }
}
