//! Civil-time helpers over `chrono-tz`.
//!
//! Stored values are always absolute Unix milliseconds. Everything here either
//! resolves a civil time in a named zone to an instant (using the zone's own
//! transition rules) or renders an instant for display.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{MINUTE_MS, Ms, TimeMode};

/// Step used to walk forward out of a DST gap.
const GAP_STEP_MINUTES: i64 = 30;
const GAP_STEP_LIMIT: usize = 48;

pub fn parse_tz(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|_| format!("unknown timezone: {name}"))
}

pub fn to_datetime(ms: Ms, tz: Tz) -> DateTime<Tz> {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&tz)
}

/// Resolve a civil time in `tz` to an instant.
///
/// Ambiguous times (fall-back overlap) take the earlier instant. Nonexistent
/// times (spring-forward gap) move forward to the first valid civil time.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Ms {
    let mut candidate = naive;
    for _ in 0..GAP_STEP_LIMIT {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt.timestamp_millis();
        }
        match candidate.checked_add_signed(TimeDelta::minutes(GAP_STEP_MINUTES)) {
            Some(next) => candidate = next,
            None => break,
        }
    }
    Utc.from_utc_datetime(&naive).timestamp_millis()
}

pub fn local_date(tz: Tz, ms: Ms) -> NaiveDate {
    to_datetime(ms, tz).date_naive()
}

/// First instant of `date` in `tz`.
pub fn start_of_day(tz: Tz, date: NaiveDate) -> Ms {
    resolve_local(tz, date.and_time(NaiveTime::MIN))
}

/// Smallest local midnight at or after `ms`.
pub fn ceil_to_local_midnight(tz: Tz, ms: Ms) -> Ms {
    let date = local_date(tz, ms);
    let midnight = start_of_day(tz, date);
    if midnight >= ms {
        return midnight;
    }
    match date.succ_opt() {
        Some(next) => start_of_day(tz, next),
        None => midnight,
    }
}

pub fn ceil_to_minute(ms: Ms) -> Ms {
    (ms + MINUTE_MS - 1).div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Add whole civil days in `tz`, keeping the wall-clock time across DST changes.
pub fn add_days(tz: Tz, ms: Ms, days: i64) -> Ms {
    let local = to_datetime(ms, tz).naive_local();
    match local.checked_add_signed(TimeDelta::days(days)) {
        Some(shifted) => resolve_local(tz, shifted),
        None => ms,
    }
}

/// Re-express an instant in another zone. The instant itself never changes.
pub fn convert(dt: DateTime<Tz>, to: Tz) -> DateTime<Tz> {
    dt.with_timezone(&to)
}

/// Display label for a proposal boundary.
///
/// Day-granularity bookings render the calendar date as the professional sees
/// it. Hour-granularity bookings render the viewer's local date and time.
pub fn project(ms: Ms, professional_tz: Tz, viewer_tz: Tz, mode: TimeMode) -> String {
    match mode {
        TimeMode::Days => local_date(professional_tz, ms).format("%Y-%m-%d").to_string(),
        TimeMode::Hours => {
            let viewer = convert(to_datetime(ms, professional_tz), viewer_tz);
            viewer.format("%Y-%m-%d %H:%M %Z").to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::{America::New_York, Asia::Tokyo, Europe::Brussels, UTC};

    fn naive(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.from_utc_datetime(&naive(y, mo, d, h, mi)).timestamp_millis()
    }

    #[test]
    fn round_trip_between_zones_is_exact() {
        let instants = [
            utc_ms(2025, 3, 30, 0, 59),
            utc_ms(2025, 3, 30, 1, 0),
            utc_ms(2025, 10, 26, 0, 30),
            utc_ms(2025, 10, 26, 1, 30),
            utc_ms(2025, 11, 2, 6, 15) + 123,
        ];
        for ms in instants {
            let a = to_datetime(ms, Brussels);
            let b = convert(a, New_York);
            let back = convert(b, Brussels);
            assert_eq!(back, a);
            assert_eq!(back.timestamp_millis(), ms);
        }
    }

    #[test]
    fn ambiguous_time_takes_earlier_instant() {
        // 02:30 happens twice in Brussels on 2025-10-26.
        let ms = resolve_local(Brussels, naive(2025, 10, 26, 2, 30));
        assert_eq!(ms, utc_ms(2025, 10, 26, 0, 30));
    }

    #[test]
    fn gap_time_moves_forward() {
        // 02:30 does not exist in Brussels on 2025-03-30; 03:00 CEST is 01:00 UTC.
        let ms = resolve_local(Brussels, naive(2025, 3, 30, 2, 30));
        assert_eq!(ms, utc_ms(2025, 3, 30, 1, 0));
    }

    #[test]
    fn add_days_keeps_wall_clock_across_dst() {
        let before = resolve_local(Brussels, naive(2025, 3, 29, 9, 0));
        let after = add_days(Brussels, before, 1);
        assert_eq!(after - before, 23 * 3_600_000);
        assert_eq!(to_datetime(after, Brussels).naive_local(), naive(2025, 3, 30, 9, 0));
    }

    #[test]
    fn ceil_to_local_midnight_cases() {
        let midnight = start_of_day(Tokyo, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        assert_eq!(ceil_to_local_midnight(Tokyo, midnight), midnight);
        assert_eq!(
            ceil_to_local_midnight(Tokyo, midnight - 1),
            midnight
        );
        assert_eq!(
            ceil_to_local_midnight(Tokyo, midnight + 1),
            midnight + 86_400_000
        );
    }

    #[test]
    fn ceil_to_minute_cases() {
        assert_eq!(ceil_to_minute(0), 0);
        assert_eq!(ceil_to_minute(1), MINUTE_MS);
        assert_eq!(ceil_to_minute(MINUTE_MS), MINUTE_MS);
        assert_eq!(ceil_to_minute(-1), 0);
    }

    #[test]
    fn labels_by_mode() {
        let ms = utc_ms(2025, 1, 15, 23, 30);
        assert_eq!(project(ms, Brussels, UTC, TimeMode::Days), "2025-01-16");
        assert_eq!(project(ms, Brussels, UTC, TimeMode::Hours), "2025-01-15 23:30 UTC");
        assert_eq!(
            project(ms, Brussels, New_York, TimeMode::Hours),
            "2025-01-15 18:30 EST"
        );
    }

    #[test]
    fn parse_tz_rejects_unknown() {
        assert_eq!(parse_tz("Europe/Brussels"), Ok(Brussels));
        assert!(parse_tz("Mars/Olympus").is_err());
    }
}
