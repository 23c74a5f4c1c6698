use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{DEFAULT_DURATION_MINUTES, MINUTE_MS};

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Half-open interval test over raw instants: `[a_start, a_end)` and
/// `[b_start, b_end)` intersect iff `a_start < b_end && b_start < a_end`.
///
/// Both intervals must be well ordered (`start < end`).
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    debug_assert!(a_start < a_end, "interval a must satisfy start < end");
    debug_assert!(b_start < b_end, "interval b must satisfy start < end");
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// `[start, start + minutes)`.
    pub fn from_minutes(start: Ms, minutes: i64) -> Self {
        Self::new(start, start + minutes * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Falls back to the system default when a duration is missing or zero.
pub fn effective_minutes(duration_minutes: Option<u32>) -> i64 {
    match duration_minutes {
        Some(m) if m > 0 => i64::from(m),
        _ => DEFAULT_DURATION_MINUTES,
    }
}

/// Display grouping for shifts. Never used by overlap or ordering logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShiftType {
    Morning,
    Afternoon,
    Night,
}

/// A recurring working interval on one weekday, in the provider's local wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub weekday: Weekday,
    pub shift_type: ShiftType,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub is_working: bool,
}

impl Shift {
    /// 0 = Sunday .. 6 = Saturday.
    pub fn day_of_week(&self) -> u32 {
        self.weekday.num_days_from_sunday()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    /// Cancelled appointments free their interval.
    pub fn occupies_time(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRef {
    pub client_id: Option<Ulid>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub name: String,
    pub duration_minutes: Option<u32>,
}

impl Service {
    pub fn effective_minutes(&self) -> i64 {
        effective_minutes(self.duration_minutes)
    }
}

/// What a provider interval represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    /// Explicit unavailability, overrides shifts.
    TimeBlock { reason: Option<String> },
    /// Duration is the snapshot taken at admission.
    Appointment {
        client: ClientRef,
        duration_minutes: Option<u32>,
        status: AppointmentStatus,
    },
}

/// A dated interval on a provider's calendar: a time block or an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    /// Time blocks and non-cancelled appointments.
    pub fn is_busy(&self) -> bool {
        match &self.kind {
            IntervalKind::TimeBlock { .. } => true,
            IntervalKind::Appointment { status, .. } => status.occupies_time(),
        }
    }

    pub fn is_time_block(&self) -> bool {
        matches!(self.kind, IntervalKind::TimeBlock { .. })
    }

    pub fn is_active_appointment(&self) -> bool {
        matches!(&self.kind, IntervalKind::Appointment { status, .. } if status.occupies_time())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: Option<String>,
    pub shifts: Vec<Shift>,
    pub services: Vec<Service>,
    /// Time blocks and appointments, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl ProviderState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            shifts: Vec::new(),
            services: Vec::new(),
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn interval(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    pub fn interval_mut(&mut self, id: Ulid) -> Option<&mut Interval> {
        self.intervals.iter_mut().find(|i| i.id == id)
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    /// Working shifts for a weekday, ordered by start time.
    pub fn working_shifts(&self, weekday: Weekday) -> Vec<&Shift> {
        let mut shifts: Vec<&Shift> = self
            .shifts
            .iter()
            .filter(|s| s.weekday == weekday && s.is_working)
            .collect();
        shifts.sort_by_key(|s| (s.start, s.end));
        shifts
    }

    pub fn upsert_shift(&mut self, shift: Shift) {
        match self.shifts.iter_mut().find(|s| s.id == shift.id) {
            Some(existing) => *existing = shift,
            None => self.shifts.push(shift),
        }
    }

    pub fn upsert_service(&mut self, service: Service) {
        match self.services.iter_mut().find(|s| s.id == service.id) {
            Some(existing) => *existing = service,
            None => self.services.push(service),
        }
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: Option<String>,
    },
    ProviderDeleted {
        id: Ulid,
    },
    ShiftSet {
        shift: Shift,
    },
    ShiftRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    /// Replaces every shift of one weekday.
    DayShiftsReplaced {
        provider_id: Ulid,
        weekday: Weekday,
        shifts: Vec<Shift>,
    },
    TimeBlockAdded {
        id: Ulid,
        provider_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    TimeBlockRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    ServiceSet {
        service: Service,
    },
    ServiceRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
        duration_minutes: Option<u32>,
        client: ClientRef,
    },
    AppointmentStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: AppointmentStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBlockInfo {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub start: Ms,
    pub duration_minutes: Option<u32>,
    pub status: AppointmentStatus,
    pub client: ClientRef,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, effective_minutes(self.duration_minutes))
    }
}

/// Everything the booking flow needs to present one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub shifts: Vec<Shift>,
    pub appointments: Vec<Appointment>,
    pub time_blocks: Vec<TimeBlockInfo>,
}

/// A bookable start time. `shift_type` is presentation metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub shift_id: Ulid,
    pub shift_type: ShiftType,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::TimeBlock { reason: None },
        }
    }

    fn appointment(start: Ms, end: Ms, status: AppointmentStatus) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::Appointment {
                client: ClientRef {
                    client_id: None,
                    name: "Ana".into(),
                },
                duration_minutes: Some(30),
                status,
            },
        }
    }

    fn hm(h: u32, m: u32) -> Ms {
        i64::from(h * 60 + m) * MINUTE_MS
    }

    #[test]
    fn overlaps_half_open_boundary() {
        assert!(!overlaps(hm(10, 0), hm(10, 30), hm(10, 30), hm(11, 0)));
        assert!(overlaps(hm(10, 0), hm(10, 31), hm(10, 30), hm(11, 0)));
    }

    #[test]
    fn overlaps_is_symmetric_and_catches_containment() {
        assert!(overlaps(hm(9, 0), hm(12, 0), hm(10, 0), hm(10, 30)));
        assert!(overlaps(hm(10, 0), hm(10, 30), hm(9, 0), hm(12, 0)));
        assert!(!overlaps(hm(11, 0), hm(12, 0), hm(9, 0), hm(10, 0)));
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
        assert!(Span::try_new(200, 200).is_none());
        assert!(Span::try_new(300, 200).is_none());
        assert_eq!(Span::from_minutes(0, 30), Span::new(0, 30 * MINUTE_MS));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn default_duration_fallback() {
        assert_eq!(effective_minutes(None), DEFAULT_DURATION_MINUTES);
        assert_eq!(effective_minutes(Some(0)), DEFAULT_DURATION_MINUTES);
        assert_eq!(effective_minutes(Some(45)), 45);
    }

    #[test]
    fn cancelled_appointment_is_not_busy() {
        assert!(block(0, 100).is_busy());
        assert!(appointment(0, 100, AppointmentStatus::Scheduled).is_busy());
        assert!(appointment(0, 100, AppointmentStatus::Completed).is_busy());
        assert!(!appointment(0, 100, AppointmentStatus::Cancelled).is_busy());
    }

    #[test]
    fn interval_ordering() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_interval(block(300, 400));
        ps.insert_interval(appointment(100, 200, AppointmentStatus::Scheduled));
        ps.insert_interval(block(200, 300));
        let starts: Vec<Ms> = ps.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        let ids: Vec<Ulid> = (0..3)
            .map(|i| {
                let iv = block(i * 100, i * 100 + 50);
                let id = iv.id;
                ps.insert_interval(iv);
                id
            })
            .collect();
        assert!(ps.remove_interval(ids[1]).is_some());
        assert!(ps.remove_interval(Ulid::new()).is_none());
        assert_eq!(ps.intervals.len(), 2);
        assert_eq!(ps.intervals[0].id, ids[0]);
        assert_eq!(ps.intervals[1].id, ids[2]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_interval(block(100, 200));
        ps.insert_interval(block(450, 600));
        ps.insert_interval(block(1000, 1100));
        let hits: Vec<_> = ps.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_interval(block(100, 200));
        assert_eq!(ps.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(ps.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn overlapping_block_spanning_query() {
        let mut ps = ProviderState::new(Ulid::new(), None);
        ps.insert_interval(block(0, 10_000));
        assert_eq!(ps.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn working_shifts_filters_and_sorts() {
        let pid = Ulid::new();
        let mut ps = ProviderState::new(pid, None);
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        let mk = |weekday, start, end, is_working| Shift {
            id: Ulid::new(),
            provider_id: pid,
            weekday,
            shift_type: ShiftType::Morning,
            start: t(start),
            end: t(end),
            is_working,
        };
        ps.upsert_shift(mk(Weekday::Mon, 14, 18, true));
        ps.upsert_shift(mk(Weekday::Mon, 9, 12, true));
        ps.upsert_shift(mk(Weekday::Mon, 19, 21, false));
        ps.upsert_shift(mk(Weekday::Tue, 9, 12, true));

        let monday = ps.working_shifts(Weekday::Mon);
        assert_eq!(monday.len(), 2);
        assert_eq!(monday[0].start, t(9));
        assert_eq!(monday[1].start, t(14));
        assert_eq!(monday[0].day_of_week(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ShiftSet {
            shift: Shift {
                id: Ulid::new(),
                provider_id: Ulid::new(),
                weekday: Weekday::Sat,
                shift_type: ShiftType::Night,
                start: NaiveTime::from_hms_opt(18, 30, 0).unwrap(),
                end: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                is_working: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
