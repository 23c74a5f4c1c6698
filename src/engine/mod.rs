mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod time;

pub use availability::{busy_spans, generate_slots, merge_overlapping};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction or counters look at the log.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's scheduling state: providers with their shifts, services,
/// time blocks and appointments, persisted through the WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedProviderState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (shift/service/block/appointment) id → provider id
    pub(super) entity_to_provider: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared from their first check until the event is
    /// applied; compaction holds it exclusively from snapshot to file swap.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event directly to a ProviderState (caller holds the lock).
fn apply_to_provider(ps: &mut ProviderState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ShiftSet { shift } => {
            entity_map.insert(shift.id, shift.provider_id);
            ps.upsert_shift(shift.clone());
        }
        Event::ShiftRemoved { id, .. } => {
            ps.shifts.retain(|s| s.id != *id);
            entity_map.remove(id);
        }
        Event::DayShiftsReplaced {
            provider_id,
            weekday,
            shifts,
        } => {
            for old in ps.shifts.iter().filter(|s| s.weekday == *weekday) {
                entity_map.remove(&old.id);
            }
            ps.shifts.retain(|s| s.weekday != *weekday);
            for shift in shifts {
                entity_map.insert(shift.id, *provider_id);
                ps.shifts.push(shift.clone());
            }
        }
        Event::TimeBlockAdded {
            id,
            provider_id,
            span,
            reason,
        } => {
            ps.insert_interval(Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::TimeBlock {
                    reason: reason.clone(),
                },
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::TimeBlockRemoved { id, .. } => {
            ps.remove_interval(*id);
            entity_map.remove(id);
        }
        Event::ServiceSet { service } => {
            entity_map.insert(service.id, service.provider_id);
            ps.upsert_service(service.clone());
        }
        Event::ServiceRemoved { id, .. } => {
            ps.services.retain(|s| s.id != *id);
            entity_map.remove(id);
        }
        Event::AppointmentBooked {
            id,
            provider_id,
            start,
            duration_minutes,
            client,
        } => {
            ps.insert_interval(Interval {
                id: *id,
                span: Span::from_minutes(*start, effective_minutes(*duration_minutes)),
                kind: IntervalKind::Appointment {
                    client: client.clone(),
                    duration_minutes: *duration_minutes,
                    status: AppointmentStatus::Scheduled,
                },
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(Interval {
                kind: IntervalKind::Appointment { status: current, .. },
                ..
            }) = ps.interval_mut(*id)
            {
                *current = *status;
            }
        }
        // ProviderCreated/Deleted are handled at the DashMap level, not here
        Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => {}
    }
}

/// Drop every reverse-lookup entry owned by a provider.
fn unmap_provider(ps: &ProviderState, entity_map: &DashMap<Ulid, Ulid>) {
    let ids = ps
        .shifts
        .iter()
        .map(|s| s.id)
        .chain(ps.services.iter().map(|s| s.id))
        .chain(ps.intervals.iter().map(|i| i.id));
    for id in ids {
        entity_map.remove(&id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_provider: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // Replay events. We're the sole owner of these Arcs, so try_write always
        // succeeds; never use blocking_write here since this may run inside an
        // async context (lazy tenant creation).
        for event in &events {
            match event {
                Event::ProviderCreated { id, name } => {
                    let ps = ProviderState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::ProviderDeleted { id } => {
                    if let Some((_, shared)) = engine.state.remove(id)
                        && let Ok(guard) = shared.try_read()
                    {
                        unmap_provider(&guard, &engine.entity_to_provider);
                    }
                }
                other => {
                    if let Some(provider_id) = event_provider_id(other)
                        && let Some(entry) = engine.state.get(&provider_id)
                    {
                        let shared = entry.value().clone();
                        drop(entry);
                        if let Ok(mut guard) = shared.try_write() {
                            apply_to_provider(&mut guard, other, &engine.entity_to_provider);
                        }
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_provider(ps, event, &self.entity_to_provider);
        Ok(())
    }

    /// Shared side of the compaction gate. Take it before any provider lock.
    pub(super) async fn mutation_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction_gate.read().await
    }

    /// Acquire a provider's write lock. A provider deleted while we waited
    /// is reported as `NotFound` rather than handing out its orphaned state.
    pub(super) async fn lock_provider(
        &self,
        provider_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let ps = self
            .get_provider(&provider_id)
            .ok_or(EngineError::NotFound(provider_id))?;
        let guard = ps.clone().write_owned().await;
        let still_current = self
            .state
            .get(&provider_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &ps));
        if !still_current {
            return Err(EngineError::NotFound(provider_id));
        }
        Ok(guard)
    }

    /// Lookup entity → provider, get provider, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ProviderState>), EngineError> {
        let provider_id = self
            .get_provider_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self
            .lock_provider(provider_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))?;
        Ok((provider_id, guard))
    }
}

/// Extract the provider id from an event (for non-Create/Delete events).
fn event_provider_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ShiftSet { shift } => Some(shift.provider_id),
        Event::ServiceSet { service } => Some(service.provider_id),
        Event::ShiftRemoved { provider_id, .. }
        | Event::DayShiftsReplaced { provider_id, .. }
        | Event::TimeBlockAdded { provider_id, .. }
        | Event::TimeBlockRemoved { provider_id, .. }
        | Event::ServiceRemoved { provider_id, .. }
        | Event::AppointmentBooked { provider_id, .. }
        | Event::AppointmentStatusChanged { provider_id, .. } => Some(*provider_id),
        Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => None,
    }
}
