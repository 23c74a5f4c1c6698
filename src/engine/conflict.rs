use chrono::Datelike;
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::time::{local_date, shift_window};
use super::EngineError;

/// Checks a caller-built span before anything reaches the WAL.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_TIME_BLOCK_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Admission step 1: reject non-positive durations and starts in the past
/// beyond the clock-skew tolerance. Returns the requested interval.
pub(crate) fn validate_booking_request(
    start: Ms,
    duration_minutes: i64,
    now: Ms,
) -> Result<Span, EngineError> {
    if duration_minutes <= 0 {
        return Err(EngineError::InvalidInput("duration must be positive"));
    }
    if duration_minutes > MAX_BOOKING_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    if start < now.saturating_sub(ADMISSION_CLOCK_SKEW_MS) {
        return Err(EngineError::InvalidInput("start time is in the past"));
    }
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::InvalidInput("start time out of range"));
    }
    let span = Span::from_minutes(start, duration_minutes);
    validate_span(&span)?;
    Ok(span)
}

/// Admission steps 2–4 against the provider's current state. The caller must
/// hold the provider's write lock across this check and the insert.
pub(crate) fn check_admission(ps: &ProviderState, span: &Span, tz: Tz) -> Result<(), EngineError> {
    check_within_shift(ps, span, tz)?;
    check_no_conflict(ps, span)
}

/// Some working shift on the requested local day must contain the whole span.
pub(crate) fn check_within_shift(ps: &ProviderState, span: &Span, tz: Tz) -> Result<(), EngineError> {
    let date = local_date(tz, span.start);
    let contained = ps
        .working_shifts(date.weekday())
        .into_iter()
        .filter_map(|shift| shift_window(shift, date, tz))
        .any(|window| window.contains_span(span));
    if contained {
        Ok(())
    } else {
        Err(EngineError::OutsideWorkingHours)
    }
}

/// Time blocks take precedence over appointments in the reported reason.
pub(crate) fn check_no_conflict(ps: &ProviderState, span: &Span) -> Result<(), EngineError> {
    let mut taken_by = None;
    for interval in ps.overlapping(span) {
        match &interval.kind {
            IntervalKind::TimeBlock { .. } => {
                return Err(EngineError::BlockedByTimeOff(interval.id));
            }
            IntervalKind::Appointment { status, .. } if status.occupies_time() => {
                taken_by.get_or_insert(interval.id);
            }
            IntervalKind::Appointment { .. } => {}
        }
    }
    match taken_by {
        Some(id) => Err(EngineError::SlotTaken(id)),
        None => Ok(()),
    }
}
