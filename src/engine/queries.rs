use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::generate_slots;
use super::time::day_window;
use super::{Engine, EngineError, SharedProviderState};

/// Sum the catalogue durations of `service_ids`, substituting the default for
/// services without one.
pub(super) fn sum_service_minutes(ps: &ProviderState, service_ids: &[Ulid]) -> Result<i64, EngineError> {
    if service_ids.is_empty() {
        return Err(EngineError::InvalidInput("at least one service is required"));
    }
    if service_ids.len() > MAX_SERVICES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many services in one booking"));
    }
    service_ids.iter().try_fold(0i64, |total, id| {
        let service = ps
            .services
            .iter()
            .find(|s| s.id == *id)
            .ok_or(EngineError::NotFound(*id))?;
        Ok(total + service.effective_minutes())
    })
}

pub(super) fn appointment_info(provider_id: Ulid, interval: &Interval) -> Option<Appointment> {
    match &interval.kind {
        IntervalKind::Appointment {
            client,
            duration_minutes,
            status,
        } => Some(Appointment {
            id: interval.id,
            provider_id,
            start: interval.span.start,
            duration_minutes: *duration_minutes,
            status: *status,
            client: client.clone(),
        }),
        IntervalKind::TimeBlock { .. } => None,
    }
}

fn time_block_info(provider_id: Ulid, interval: &Interval) -> Option<TimeBlockInfo> {
    match &interval.kind {
        IntervalKind::TimeBlock { reason } => Some(TimeBlockInfo {
            id: interval.id,
            provider_id,
            start: interval.span.start,
            end: interval.span.end,
            reason: reason.clone(),
        }),
        IntervalKind::Appointment { .. } => None,
    }
}

fn validate_window(window: &Span) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::InvalidInput("window start must be before end"));
    }
    if window.end.saturating_sub(window.start) > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    fn require_provider(&self, provider_id: Ulid) -> Result<SharedProviderState, EngineError> {
        self.get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))
    }

    /// Bookable start times for `day` in the provider's timezone `tz`, as of `now`.
    pub async fn generate_slots(
        &self,
        provider_id: Ulid,
        day: NaiveDate,
        duration_minutes: i64,
        tz: Tz,
        now: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        let started = std::time::Instant::now();
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        let slots = generate_slots(&guard, day, duration_minutes, tz, now);
        drop(guard);

        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(slots)
    }

    /// Read aggregate for one local day: the weekday's working shifts, the
    /// non-cancelled appointments and the time blocks touching that day.
    pub async fn get_availability(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        tz: Tz,
    ) -> Result<DayAvailability, EngineError> {
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        let window = day_window(tz, date);

        let shifts = guard
            .working_shifts(date.weekday())
            .into_iter()
            .cloned()
            .collect();
        let mut appointments = Vec::new();
        let mut time_blocks = Vec::new();
        for interval in guard.overlapping(&window) {
            if interval.is_active_appointment() {
                appointments.extend(appointment_info(provider_id, interval));
            } else {
                time_blocks.extend(time_block_info(provider_id, interval));
            }
        }

        Ok(DayAvailability {
            shifts,
            appointments,
            time_blocks,
        })
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let providers: Vec<SharedProviderState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(providers.len());
        for shared in providers {
            let ps = shared.read().await;
            infos.push(ProviderInfo {
                id: ps.id,
                name: ps.name.clone(),
            });
        }
        infos
    }

    /// All shifts, working or not, ordered by weekday then start time.
    pub async fn get_shifts(&self, provider_id: Ulid) -> Result<Vec<Shift>, EngineError> {
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        let mut shifts = guard.shifts.clone();
        shifts.sort_by_key(|s| (s.day_of_week(), s.start));
        Ok(shifts)
    }

    pub async fn get_services(&self, provider_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        Ok(guard.services.clone())
    }

    /// Total booking duration for a set of services, as admission would compute it.
    pub async fn total_duration(
        &self,
        provider_id: Ulid,
        service_ids: &[Ulid],
    ) -> Result<i64, EngineError> {
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        sum_service_minutes(&guard, service_ids)
    }

    /// Time blocks touching `window`, or all of them when `window` is `None`.
    pub async fn get_time_blocks(
        &self,
        provider_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<TimeBlockInfo>, EngineError> {
        if let Some(w) = &window {
            validate_window(w)?;
        }
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        let blocks = match &window {
            Some(w) => guard
                .overlapping(w)
                .filter_map(|i| time_block_info(provider_id, i))
                .collect(),
            None => guard
                .intervals
                .iter()
                .filter_map(|i| time_block_info(provider_id, i))
                .collect(),
        };
        Ok(blocks)
    }

    /// Appointments of any status touching `window`, or all of them, by start time.
    pub async fn get_appointments(
        &self,
        provider_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        if let Some(w) = &window {
            validate_window(w)?;
        }
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        let appointments = match &window {
            Some(w) => guard
                .overlapping(w)
                .filter_map(|i| appointment_info(provider_id, i))
                .collect(),
            None => guard
                .intervals
                .iter()
                .filter_map(|i| appointment_info(provider_id, i))
                .collect(),
        };
        Ok(appointments)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let provider_id = self
            .get_provider_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ps = self.require_provider(provider_id)?;
        let guard = ps.read().await;
        guard
            .interval(id)
            .and_then(|i| appointment_info(provider_id, i))
            .ok_or(EngineError::NotFound(id))
    }
}
