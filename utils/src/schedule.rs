//! Evaluation of agent-local scheduled times.
//!
//! Scheduled times are stored as wall-clock strings without an offset and are
//! interpreted in the endpoint's own time zone.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

pub const SCHEDULED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_scheduled_time(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), SCHEDULED_TIME_FORMAT)
        .map_err(|e| anyhow!("invalid scheduled time {:?}: {}", value, e))
}

/// Returns true once `scheduled` is strictly before the current wall-clock
/// time of `time_zone`.
///
/// Without a time zone the schedule is always due. An unknown time zone name
/// is evaluated as UTC and an unparsable schedule counts as due, so a bad
/// value never holds work back forever.
pub fn is_scheduled_time_due(scheduled: &str, time_zone: Option<&str>, now: DateTime<Utc>) -> bool {
    let Some(time_zone) = time_zone.map(str::trim).filter(|tz| !tz.is_empty()) else {
        return true;
    };
    let scheduled_local = match parse_scheduled_time(scheduled) {
        Ok(scheduled_local) => scheduled_local,
        Err(err) => {
            warn!("treating scheduled time as due: {:?}", err);
            return true;
        }
    };
    let now_local = match time_zone.parse::<Tz>() {
        Ok(tz) => now.with_timezone(&tz).naive_local(),
        Err(_) => {
            warn!(time_zone, "unknown time zone, evaluating schedule in UTC");
            now.naive_utc()
        }
    };
    scheduled_local < now_local
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_time_zone_is_always_due() {
        assert!(is_scheduled_time_due("2999-01-01 00:00:00", None, noon_utc()));
        assert!(is_scheduled_time_due("2999-01-01 00:00:00", Some(""), noon_utc()));
    }

    #[test]
    fn test_due_is_evaluated_in_local_time() {
        // 12:00 UTC is 14:00 in Paris during summer time.
        let now = noon_utc();
        assert!(is_scheduled_time_due("2024-06-01 13:30:00", Some("Europe/Paris"), now));
        assert!(!is_scheduled_time_due("2024-06-01 14:30:00", Some("Europe/Paris"), now));
        // 12:00 UTC is 08:00 in New York.
        assert!(!is_scheduled_time_due("2024-06-01 09:00:00", Some("America/New_York"), now));
    }

    #[test]
    fn test_due_is_strict() {
        assert!(!is_scheduled_time_due("2024-06-01 12:00:00", Some("UTC"), noon_utc()));
        assert!(is_scheduled_time_due("2024-06-01 11:59:59", Some("UTC"), noon_utc()));
    }

    #[test]
    fn test_bad_inputs_fall_back() {
        assert!(is_scheduled_time_due("tomorrow", Some("UTC"), noon_utc()));
        assert!(!is_scheduled_time_due("2024-06-01 12:30:00", Some("Mars/Olympus"), noon_utc()));
        assert!(parse_scheduled_time("2024-06-01T12:30:00").is_err());
    }
}
