use std::sync::Arc;

use chrono::Weekday;
use chrono_tz::Tz;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::BookingCreated;

use super::conflict::{check_admission, validate_booking_request, validate_span};
use super::queries::{appointment_info, sum_service_minutes};
use super::{unmap_provider, Engine, EngineError, WalCommand};

/// Where an admission gets its duration from.
enum DurationSource<'a> {
    Minutes(i64),
    Services(&'a [Ulid]),
}

fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_shift(shift: &Shift) -> Result<(), EngineError> {
    if shift.is_working && shift.start >= shift.end {
        return Err(EngineError::InvalidInput("shift must start before it ends"));
    }
    Ok(())
}

fn check_day_capacity(ps: &ProviderState, weekday: Weekday, replacing: Option<Ulid>) -> Result<(), EngineError> {
    let count = ps
        .shifts
        .iter()
        .filter(|s| s.weekday == weekday && Some(s.id) != replacing)
        .count();
    if count >= MAX_SHIFTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many shifts on one day"));
    }
    Ok(())
}

fn check_interval_capacity(ps: &ProviderState) -> Result<(), EngineError> {
    if ps.intervals.len() >= MAX_INTERVALS_PER_PROVIDER {
        return Err(EngineError::LimitExceeded("too many intervals on provider"));
    }
    Ok(())
}

fn record_admission(result: &Result<Appointment, EngineError>) {
    let outcome = match result {
        Ok(_) => "admitted",
        Err(e) => e.label(),
    };
    metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    fn ensure_new_entity(&self, id: Ulid) -> Result<(), EngineError> {
        if self.entity_to_provider.contains_key(&id) || self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    // ── Providers ────────────────────────────────────────────

    pub async fn create_provider(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        validate_name(name.as_deref())?;
        let _gate = self.mutation_gate().await;
        self.ensure_new_entity(id)?;

        let event = Event::ProviderCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(ProviderState::new(id, name))));
        Ok(())
    }

    /// Removes the provider together with its shifts, services, blocks and appointments.
    pub async fn delete_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.mutation_gate().await;
        let guard = self.lock_provider(id).await?;

        let event = Event::ProviderDeleted { id };
        self.wal_append(&event).await?;
        unmap_provider(&guard, &self.entity_to_provider);
        self.state.remove(&id);
        self.notify.remove(&id);
        Ok(())
    }

    // ── Shifts ───────────────────────────────────────────────

    pub async fn add_shift(&self, shift: Shift) -> Result<(), EngineError> {
        validate_shift(&shift)?;
        let _gate = self.mutation_gate().await;
        self.ensure_new_entity(shift.id)?;
        let mut guard = self.lock_provider(shift.provider_id).await?;
        check_day_capacity(&guard, shift.weekday, None)?;

        self.persist_and_apply(&mut guard, &Event::ShiftSet { shift }).await
    }

    /// Replace an existing shift's times, weekday, type or working flag.
    pub async fn update_shift(&self, shift: Shift) -> Result<(), EngineError> {
        validate_shift(&shift)?;
        let _gate = self.mutation_gate().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&shift.id).await?;
        if provider_id != shift.provider_id || !guard.shifts.iter().any(|s| s.id == shift.id) {
            return Err(EngineError::NotFound(shift.id));
        }
        check_day_capacity(&guard, shift.weekday, Some(shift.id))?;

        self.persist_and_apply(&mut guard, &Event::ShiftSet { shift }).await
    }

    pub async fn remove_shift(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.mutation_gate().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.shifts.iter().any(|s| s.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ShiftRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(provider_id)
    }

    /// Atomically swap every shift of one weekday, as saved from a weekly schedule form.
    pub async fn replace_day_shifts(
        &self,
        provider_id: Ulid,
        weekday: Weekday,
        shifts: Vec<Shift>,
    ) -> Result<(), EngineError> {
        if shifts.len() > MAX_SHIFTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many shifts on one day"));
        }
        for shift in &shifts {
            validate_shift(shift)?;
            if shift.provider_id != provider_id || shift.weekday != weekday {
                return Err(EngineError::InvalidInput("shift does not belong to the replaced day"));
            }
        }
        let _gate = self.mutation_gate().await;
        let mut guard = self.lock_provider(provider_id).await?;
        for shift in &shifts {
            let reused = guard.shifts.iter().any(|s| s.id == shift.id && s.weekday == weekday);
            if !reused && self.entity_to_provider.contains_key(&shift.id) {
                return Err(EngineError::AlreadyExists(shift.id));
            }
        }

        let event = Event::DayShiftsReplaced {
            provider_id,
            weekday,
            shifts,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Time blocks ──────────────────────────────────────────

    pub async fn add_time_block(
        &self,
        id: Ulid,
        provider_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.mutation_gate().await;
        self.ensure_new_entity(id)?;
        let mut guard = self.lock_provider(provider_id).await?;
        check_interval_capacity(&guard)?;

        let event = Event::TimeBlockAdded {
            id,
            provider_id,
            span,
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_time_block(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.mutation_gate().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.interval(id).is_some_and(Interval::is_time_block) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::TimeBlockRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(provider_id)
    }

    // ── Services ─────────────────────────────────────────────

    /// Create or edit a service. Edits never touch durations already
    /// snapshotted onto appointments.
    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        validate_name(Some(&service.name))?;
        let _gate = self.mutation_gate().await;
        if let Some(owner) = self.get_provider_for_entity(&service.id)
            && owner != service.provider_id
        {
            return Err(EngineError::AlreadyExists(service.id));
        }
        let mut guard = self.lock_provider(service.provider_id).await?;
        let is_new = !guard.services.iter().any(|s| s.id == service.id);
        if is_new && guard.services.len() >= MAX_SERVICES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        self.persist_and_apply(&mut guard, &Event::ServiceSet { service }).await
    }

    pub async fn remove_service(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.mutation_gate().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.services.iter().any(|s| s.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ServiceRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(provider_id)
    }

    // ── Admission ────────────────────────────────────────────

    /// Admit a booking of `duration_minutes` starting at `start`.
    ///
    /// Validity is re-derived from live state while the provider's write lock
    /// is held across the check and the WAL commit, so two overlapping
    /// admissions for one provider can never both succeed. Slot lists seen
    /// earlier by the caller carry no reservation.
    pub async fn admit_booking(
        &self,
        provider_id: Ulid,
        start: Ms,
        duration_minutes: i64,
        client: ClientRef,
        tz: Tz,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        let result = self
            .admit(provider_id, start, DurationSource::Minutes(duration_minutes), client, tz, now)
            .await;
        record_admission(&result);
        result
    }

    /// Admit a booking for a set of services; the total duration is summed from
    /// the provider's current catalogue and snapshotted onto the appointment.
    pub async fn request_booking(
        &self,
        provider_id: Ulid,
        start: Ms,
        service_ids: &[Ulid],
        client: ClientRef,
        tz: Tz,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        let result = self
            .admit(provider_id, start, DurationSource::Services(service_ids), client, tz, now)
            .await;
        record_admission(&result);
        result
    }

    async fn admit(
        &self,
        provider_id: Ulid,
        start: Ms,
        duration: DurationSource<'_>,
        client: ClientRef,
        tz: Tz,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        if client.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("client name is required"));
        }
        validate_name(Some(&client.name))?;
        let _gate = self.mutation_gate().await;
        let mut guard = self.lock_provider(provider_id).await?;

        let minutes = match duration {
            DurationSource::Minutes(m) => m,
            DurationSource::Services(ids) => sum_service_minutes(&guard, ids)?,
        };
        let span = validate_booking_request(start, minutes, now)?;
        check_interval_capacity(&guard)?;
        check_admission(&guard, &span, tz)?;

        let duration_minutes = u32::try_from(minutes)
            .map_err(|_| EngineError::LimitExceeded("booking too long"))?;
        let id = Ulid::new();
        let event = Event::AppointmentBooked {
            id,
            provider_id,
            start,
            duration_minutes: Some(duration_minutes),
            client: client.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        self.notify.send(BookingCreated {
            provider_id,
            appointment_id: id,
            client_name: client.name.clone(),
            start,
        });

        Ok(Appointment {
            id,
            provider_id,
            start,
            duration_minutes: Some(duration_minutes),
            status: AppointmentStatus::Scheduled,
            client,
        })
    }

    // ── Appointment lifecycle ────────────────────────────────

    pub async fn complete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentStatus::Completed).await
    }

    /// Cancelling frees the appointment's interval for new bookings.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition_appointment(id, AppointmentStatus::Cancelled).await
    }

    async fn transition_appointment(
        &self,
        id: Ulid,
        to: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.mutation_gate().await;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let from = match guard.interval(id).map(|i| &i.kind) {
            Some(IntervalKind::Appointment { status, .. }) => *status,
            _ => return Err(EngineError::NotFound(id)),
        };
        if from != AppointmentStatus::Scheduled {
            return Err(EngineError::InvalidTransition { id, from, to });
        }

        let event = Event::AppointmentStatusChanged {
            id,
            provider_id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .interval(id)
            .and_then(|i| appointment_info(provider_id, i))
            .ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// No mutation can append between the snapshot and the file swap, so every
    /// committed event lands either in the snapshot or in the new log.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let providers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();

        for shared in providers {
            let ps = shared.read().await;
            events.push(Event::ProviderCreated {
                id: ps.id,
                name: ps.name.clone(),
            });
            for shift in &ps.shifts {
                events.push(Event::ShiftSet { shift: shift.clone() });
            }
            for service in &ps.services {
                events.push(Event::ServiceSet {
                    service: service.clone(),
                });
            }
            for interval in &ps.intervals {
                match &interval.kind {
                    IntervalKind::TimeBlock { reason } => events.push(Event::TimeBlockAdded {
                        id: interval.id,
                        provider_id: ps.id,
                        span: interval.span,
                        reason: reason.clone(),
                    }),
                    IntervalKind::Appointment {
                        client,
                        duration_minutes,
                        status,
                    } => {
                        events.push(Event::AppointmentBooked {
                            id: interval.id,
                            provider_id: ps.id,
                            start: interval.span.start,
                            duration_minutes: *duration_minutes,
                            client: client.clone(),
                        });
                        if *status != AppointmentStatus::Scheduled {
                            events.push(Event::AppointmentStatusChanged {
                                id: interval.id,
                                provider_id: ps.id,
                                status: *status,
                            });
                        }
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
