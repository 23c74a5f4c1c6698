use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveTime, Offset, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::limits::MINUTE_MS;
use crate::model::{Ms, Shift, Span};

const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

fn utc(t: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t).unwrap_or_default()
}

/// Resolve a wall-clock time in `tz` to an instant.
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant. Times that
/// do not exist (DST spring-forward gap) are pushed one hour later.
pub fn local_to_ms(tz: Tz, date: NaiveDate, time: NaiveTime) -> Ms {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let shifted = naive + TimeDelta::hours(1);
            match tz.from_local_datetime(&shifted).earliest() {
                Some(dt) => dt.timestamp_millis(),
                None => tz.from_utc_datetime(&naive).timestamp_millis(),
            }
        }
    }
}

pub fn local_date(tz: Tz, t: Ms) -> NaiveDate {
    utc(t).with_timezone(&tz).date_naive()
}

pub fn local_weekday(tz: Tz, t: Ms) -> Weekday {
    local_date(tz, t).weekday()
}

/// `[local midnight, next local midnight)` for `date`.
pub fn day_window(tz: Tz, date: NaiveDate) -> Span {
    let start = local_to_ms(tz, date, NaiveTime::default());
    let end = date
        .succ_opt()
        .map_or(start + DAY_MS, |next| local_to_ms(tz, next, NaiveTime::default()));
    Span::new(start, end)
}

/// The absolute interval a shift covers on `date`. `None` for non-working or
/// degenerate shifts.
pub fn shift_window(shift: &Shift, date: NaiveDate, tz: Tz) -> Option<Span> {
    if !shift.is_working {
        return None;
    }
    let start = local_to_ms(tz, date, shift.start);
    let end = local_to_ms(tz, date, shift.end);
    Span::try_new(start, end)
}

/// Round `t` up to the next multiple of `minutes` on the local wall clock.
/// Instants already on a boundary are returned unchanged.
pub fn round_up_local(tz: Tz, t: Ms, minutes: i64) -> Ms {
    let offset_ms = i64::from(
        tz.offset_from_utc_datetime(&utc(t).naive_utc())
            .fix()
            .local_minus_utc(),
    ) * 1000;
    let step = minutes * MINUTE_MS;
    let local = t + offset_ms;
    let floor = local.div_euclid(step) * step;
    let rounded = if floor == local { floor } else { floor + step };
    rounded - offset_ms
}
