mod availability;
mod catalog;
mod error;
mod ledger;
mod lifecycle;
mod queries;

pub use availability::{evaluate_window, generate_slots};
pub use error::{EngineError, Entity, ErrorKind};
pub use ledger::{parse_date, parse_time, today};
pub use lifecycle::{BookingRequest, Removal};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedMaster = Arc<RwLock<MasterState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

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

/// Owns the WAL. Each wake-up drains every queued append into one batch and
/// answers all of them after a single fsync.
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
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't join the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking engine: catalog, schedules, booking ledger and status history,
/// persisted through the WAL.
pub struct Engine {
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) masters: DashMap<Ulid, SharedMaster>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// Append-only status history by booking id. Kept after a booking is hard-deleted.
    pub(super) history: DashMap<Ulid, Vec<StatusChange>>,
    /// Uniqueness index over live bookings: (scope, date) → time → booking id.
    pub(super) ledger: DashMap<LedgerKey, BTreeMap<TimeOfDay, Ulid>>,
    /// Booking ids taken by a `create_booking` still in flight.
    pub(super) reserved_ids: DashMap<Ulid, ()>,
    /// Serializes catalog saves so create-or-update decisions can't interleave.
    pub(super) catalog: Mutex<()>,
    /// Mutations hold it shared; reference-checked deletes and compaction hold it exclusively.
    /// Always taken before any master or booking lock.
    pub(super) gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            services: DashMap::new(),
            masters: DashMap::new(),
            bookings: DashMap::new(),
            history: DashMap::new(),
            ledger: DashMap::new(),
            reserved_ids: DashMap::new(),
            catalog: Mutex::new(()),
            gate: RwLock::new(()),
            wal_tx,
        };

        // Sole owner of every lock during replay, so try_write never contends.
        // blocking_write would panic here when called from async code.
        for event in &events {
            engine.replay_event(event);
        }
        info!(
            "replayed {} events from {}: {} services, {} masters, {} bookings",
            events.len(),
            wal_path.display(),
            engine.services.len(),
            engine.masters.len(),
            engine.bookings.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::MasterServiceLinked { master_id, .. }
            | Event::MasterServiceUnlinked { master_id, .. }
            | Event::ScheduleReplaced { master_id, .. } => {
                if let Some(ms) = self.get_master(master_id) {
                    let mut guard = ms.try_write().expect("replay: uncontended write");
                    apply_to_master(&mut guard, event);
                }
            }
            Event::StatusChanged { change } => {
                if let Some(b) = self.get_booking(&change.booking_id) {
                    let mut guard = b.try_write().expect("replay: uncontended write");
                    self.apply_status_change(&mut guard, change);
                }
            }
            Event::ServiceDeleted { id } => {
                self.services.remove(id);
                for entry in self.masters.iter() {
                    let mut guard = entry.value().try_write().expect("replay: uncontended write");
                    guard.unlink(id);
                }
            }
            Event::MasterSaved { master } => match self.get_master(&master.id) {
                Some(ms) => {
                    let mut guard = ms.try_write().expect("replay: uncontended write");
                    guard.master = master.clone();
                }
                None => self.insert_master(master.clone()),
            },
            other => self.apply_table_event(other),
        }
    }

    /// Events that only touch the top-level maps.
    pub(super) fn apply_table_event(&self, event: &Event) {
        match event {
            Event::ServiceSaved { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::MasterDeleted { id } => {
                self.masters.remove(id);
            }
            Event::BookingCreated { booking } => {
                if booking.status.is_live() {
                    // Replayed claims can't collide; live claims are taken before the append.
                    self.ledger
                        .entry(booking.ledger_key())
                        .or_default()
                        .insert(booking.time, booking.id);
                }
                self.bookings
                    .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
            }
            Event::BookingDeleted { id } => {
                if let Some((_, b)) = self.bookings.remove(id) {
                    let guard = b.try_read().expect("deleted booking: uncontended read");
                    self.release_slot(&guard.ledger_key(), guard.time, guard.id);
                }
            }
            Event::HistoryRestored { booking_id, changes } => {
                self.history.insert(*booking_id, changes.clone());
            }
            Event::ServiceDeleted { .. }
            | Event::MasterSaved { .. }
            | Event::MasterServiceLinked { .. }
            | Event::MasterServiceUnlinked { .. }
            | Event::ScheduleReplaced { .. }
            | Event::StatusChanged { .. } => {
                unreachable!("lock-scoped event routed to apply_table_event")
            }
        }
    }

    pub(super) fn insert_master(&self, master: Master) {
        self.masters
            .insert(master.id, Arc::new(RwLock::new(MasterState::new(master))));
    }

    /// Apply a status change to a locked booking: status, comment, ledger, history.
    pub(super) fn apply_status_change(&self, booking: &mut Booking, change: &StatusChange) {
        if booking.status.is_live() && !change.to.is_live() {
            self.release_slot(&booking.ledger_key(), booking.time, booking.id);
        }
        booking.status = change.to;
        booking.admin_comment = change.comment.clone();
        booking.updated_at = change.at;
        self.history
            .entry(booking.id)
            .or_default()
            .push(change.clone());
    }

    /// Drop a ledger claim if it still belongs to `booking_id`.
    pub(super) fn release_slot(&self, key: &LedgerKey, time: TimeOfDay, booking_id: Ulid) {
        if let Some(mut day) = self.ledger.get_mut(key)
            && day.get(&time) == Some(&booking_id)
        {
            day.remove(&time);
        }
        self.ledger.remove_if(key, |_, day| day.is_empty());
    }

    /// Write event to WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_master(&self, id: &Ulid) -> Option<SharedMaster> {
        self.masters.get(id).map(|e| e.value().clone())
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// True while `shared` is still the row stored under `id` (not hard-deleted meanwhile).
    pub(super) fn is_current_booking(&self, id: &Ulid, shared: &SharedBooking) -> bool {
        self.bookings
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), shared))
    }

    /// Rewrite the WAL as the minimal event set that recreates the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|service| Event::ServiceSaved { service }));

        let mut masters: Vec<(Ulid, SharedMaster)> = self
            .masters
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        masters.sort_by_key(|(id, _)| *id);
        for (master_id, ms) in masters {
            let guard = ms.read().await;
            events.push(Event::MasterSaved {
                master: guard.master.clone(),
            });
            for &service_id in &guard.services {
                events.push(Event::MasterServiceLinked { master_id, service_id });
            }
            if !guard.schedule.is_empty() {
                events.push(Event::ScheduleReplaced {
                    master_id,
                    entries: guard.schedule.clone(),
                });
            }
        }

        let mut bookings: Vec<(Ulid, SharedBooking)> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        bookings.sort_by_key(|(id, _)| *id);
        for (_, b) in bookings {
            events.push(Event::BookingCreated {
                booking: b.read().await.clone(),
            });
        }

        let mut history: Vec<(Ulid, Vec<StatusChange>)> = self
            .history
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        history.sort_by_key(|(id, _)| *id);
        events.extend(
            history
                .into_iter()
                .map(|(booking_id, changes)| Event::HistoryRestored { booking_id, changes }),
        );

        events
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

/// Apply a master-scoped event to a locked master.
pub(super) fn apply_to_master(ms: &mut MasterState, event: &Event) {
    match event {
        Event::MasterServiceLinked { service_id, .. } => {
            ms.link(*service_id);
        }
        Event::MasterServiceUnlinked { service_id, .. } => {
            ms.unlink(service_id);
        }
        Event::ScheduleReplaced { entries, .. } => {
            let mut week = entries.clone();
            week.sort_by_key(|e| e.day_of_week);
            ms.schedule = week;
        }
        Event::MasterSaved { master } => {
            ms.master = master.clone();
        }
        _ => {}
    }
}
