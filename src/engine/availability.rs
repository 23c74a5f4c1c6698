use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;

use crate::limits::{
    DEFAULT_DURATION_MINUTES, MAX_BOOKING_DURATION_MINUTES, MAX_VALID_TIMESTAMP_MS, MINUTE_MS,
    MIN_VALID_TIMESTAMP_MS, SLOT_ALIGNMENT_MINUTES,
};
use crate::model::*;

use super::time::{day_window, round_up_local, shift_window};

// ── Slot Generation ───────────────────────────────────────────────

/// Compute bookable start times for `provider` on `day`.
///
/// Each working shift is walked independently from
/// `max(shift start, now rounded up to the quarter hour)` in steps of the full
/// requested duration. A candidate survives if it ends by the shift end and
/// does not intersect any time block or non-cancelled appointment. Slots never
/// bridge two shifts, even contiguous ones.
///
/// Non-positive durations fall back to the default. Durations longer than any
/// admissible booking, days with no working shift, and days whose shifts all
/// end before `now` yield an empty list.
pub fn generate_slots(
    provider: &ProviderState,
    day: NaiveDate,
    duration_minutes: i64,
    tz: Tz,
    now: Ms,
) -> Vec<Slot> {
    let minutes = if duration_minutes <= 0 {
        DEFAULT_DURATION_MINUTES
    } else {
        duration_minutes
    };
    if minutes > MAX_BOOKING_DURATION_MINUTES {
        return Vec::new();
    }
    let step = minutes * MINUTE_MS;

    let shifts = provider.working_shifts(day.weekday());
    if shifts.is_empty() {
        return Vec::new();
    }

    let now = now.clamp(MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS);
    let lower_bound = round_up_local(tz, now, SLOT_ALIGNMENT_MINUTES);
    let busy = busy_spans(provider, &day_window(tz, day));

    let mut slots = Vec::new();
    for shift in shifts {
        let Some(window) = shift_window(shift, day, tz) else {
            continue;
        };

        let mut bi = 0;
        let mut slot_start = window.start.max(lower_bound);
        while slot_start + step <= window.end {
            let candidate = Span::new(slot_start, slot_start + step);

            // Candidates only move forward, so busy spans ending before this one
            // can never matter again for this shift.
            while bi < busy.len() && busy[bi].end <= candidate.start {
                bi += 1;
            }
            let blocked = busy.get(bi).is_some_and(|b| b.overlaps(&candidate));

            if !blocked {
                slots.push(Slot {
                    start: candidate.start,
                    end: candidate.end,
                    shift_id: shift.id,
                    shift_type: shift.shift_type,
                });
            }
            slot_start += step;
        }
    }

    // Overlapping shift definitions may interleave or repeat starts.
    slots.sort_by_key(|s| s.start);
    slots.dedup_by_key(|s| s.start);
    slots
}

/// Time blocks and non-cancelled appointments touching `window`, merged into
/// disjoint sorted spans.
pub fn busy_spans(provider: &ProviderState, window: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = provider
        .overlapping(window)
        .filter(|i| i.is_busy())
        .map(|i| i.span)
        .collect();
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}
