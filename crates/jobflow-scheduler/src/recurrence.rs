//! Calendar recurrence helpers.
//! Two models: "previous fire + k days" for recurring jobs, and
//! "start date at HH:MM every N days" for jobs planned from a calendar.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use jobflow_core::{JobflowError, Result};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Smallest `prev + k * interval_days` (k >= 1) strictly after `now`.
///
/// Missed occurrences collapse into one: a job that was due long ago fires
/// once and then lands on its next future slot instead of catching up.
pub fn next_recurring_fire(
    prev: DateTime<Utc>,
    interval_days: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if interval_days == 0 {
        return None;
    }
    let step = DAY_MS * interval_days as i64;
    let behind = now.timestamp_millis() - prev.timestamp_millis();
    let k = if behind < 0 { 1 } else { behind / step + 1 };
    Some(prev + Duration::milliseconds(step * k))
}

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| JobflowError::Invalid(format!("bad time of day '{value}': {e}")))
}

/// First occurrence of `start_date` at `time_of_day` (UTC), stepped by
/// `interval_days`, that is strictly after `now`.
pub fn next_fire_from_start(
    start_date: NaiveDate,
    time_of_day: &str,
    interval_days: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let first = start_date.and_time(parse_time_of_day(time_of_day)?).and_utc();
    if first > now {
        return Ok(first);
    }
    next_recurring_fire(first, interval_days, now).ok_or_else(|| {
        JobflowError::Invalid(format!("{first} is in the past and the job does not recur"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_next_after_on_time_fire() {
        let prev = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = prev + Duration::seconds(5);
        let next = next_recurring_fire(prev, 1, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_long_outage_collapses_catch_up() {
        let prev = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap();
        let next = next_recurring_fire(prev, 2, now).unwrap();
        // 3/1 + 2k: 3/11 08:00 is the first slot after 3/10 09:30.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 8, 0, 0).unwrap());
        assert!(next > now);
        assert!(next - Duration::days(2) <= now);
    }

    #[test]
    fn test_exact_boundary_is_not_reused() {
        let prev = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap();
        let next = next_recurring_fire(prev, 1, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 4, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_zero_interval() {
        assert!(next_recurring_fire(Utc::now(), 0, Utc::now()).is_none());
    }

    #[test]
    fn test_from_start_date_future() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let start = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let next = next_fire_from_start(start, "07:45", 7, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 5, 7, 45, 0).unwrap());
    }

    #[test]
    fn test_from_start_date_past_steps_forward() {
        let now = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let next = next_fire_from_start(start, "09:00", 7, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 22, 9, 0, 0).unwrap());
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_from_start_date_rejects_bad_input() {
        let now = Utc::now();
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(next_fire_from_start(start, "25:99", 1, now).is_err());
        assert!(next_fire_from_start(start, "09:00", 0, now).is_err());
    }
}
