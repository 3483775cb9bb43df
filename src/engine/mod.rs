mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reviews;

pub use error::{EngineError, Entity};
pub(crate) use conflict::{validate_comment, validate_photo, validate_rating};
pub use reviews::ReviewSubmission;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::Policy;
use crate::limits::NOTIFY_TIMEOUT;
use crate::model::*;
use crate::notify::{Notice, Notifier, NotifyError};
use crate::wal::Wal;

pub type SharedDayLedger = Arc<RwLock<DayLedger>>;

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

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
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

/// Everything a committed event can change. Shared with in-flight commit
/// tasks, which apply their event after the caller may have gone away.
pub(super) struct State {
    pub(super) days: DashMap<DayKey, SharedDayLedger>,
    pub(super) appointments: DashMap<Ulid, Appointment>,
    /// Owner → appointment ids.
    pub(super) by_owner: DashMap<UserId, Vec<Ulid>>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) categories: DashMap<Ulid, Category>,
    /// Appointment id → its review.
    pub(super) reviews: DashMap<Ulid, Review>,
}

/// The booking store and lifecycle manager.
///
/// Placement state is sharded per (service, date): each `DayLedger` sits
/// behind its own lock, and every check-then-commit sequence runs while
/// holding the write lock of the day(s) it touches.
pub struct Engine {
    pub(super) state: Arc<State>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction holds it exclusively so the
    /// snapshot never misses a committed-but-unapplied event.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: Policy,
}

/// First held ledger with the given key.
fn ledger_for<'a>(held: &'a mut [&mut DayLedger], key: DayKey) -> Option<&'a mut DayLedger> {
    held.iter_mut().find(|l| l.key == key).map(|l| &mut **l)
}

/// Write event to WAL via the background group-commit writer.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::DependencyFailure("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::DependencyFailure("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::DependencyFailure(e.to_string()))
}

/// Hand a notice to the notifier. Failures are logged and counted,
/// never returned.
pub(super) async fn deliver(notifier: &dyn Notifier, notice: &Notice) -> bool {
    let kind = notice.kind.label();
    let outcome = match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(notice)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(NotifyError(format!(
            "no answer within {}s",
            NOTIFY_TIMEOUT.as_secs()
        ))),
    };
    match outcome {
        Ok(()) => {
            metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL, "kind" => kind)
                .increment(1);
            true
        }
        Err(e) => {
            tracing::warn!(
                "{kind} notice for appointment {} not delivered: {e}",
                notice.appointment_id
            );
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => kind)
                .increment(1);
            false
        }
    }
}

impl State {
    fn new() -> Self {
        Self {
            days: DashMap::new(),
            appointments: DashMap::new(),
            by_owner: DashMap::new(),
            services: DashMap::new(),
            categories: DashMap::new(),
            reviews: DashMap::new(),
        }
    }

    fn day_ledger(&self, key: DayKey) -> SharedDayLedger {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(key))))
            .clone()
    }

    /// Days whose ledgers an event mutates, sorted.
    fn event_day_keys(&self, event: &Event) -> Vec<DayKey> {
        let mut keys = match event {
            Event::AppointmentBooked { appointment } => vec![appointment.day_key()],
            Event::AppointmentRescheduled { id, date, .. } => self
                .appointments
                .get(id)
                .map(|a| vec![a.day_key(), DayKey::new(a.service_id, *date)])
                .unwrap_or_default(),
            Event::AppointmentCancelled { id, .. } => self
                .appointments
                .get(id)
                .map(|a| vec![a.day_key()])
                .unwrap_or_default(),
            Event::CategoryCreated { .. }
            | Event::ServiceCreated { .. }
            | Event::AppointmentCompleted { .. }
            | Event::ReviewSubmitted { .. } => Vec::new(),
        };
        keys.sort();
        keys.dedup();
        keys
    }

    /// Apply a committed event. `held` must contain every ledger from
    /// `event_day_keys`, write-locked by the caller.
    fn apply(&self, event: &Event, held: &mut [&mut DayLedger]) {
        match event {
            Event::CategoryCreated {
                id,
                name,
                description,
            } => {
                self.categories.insert(
                    *id,
                    Category {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                    },
                );
            }
            Event::ServiceCreated { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::AppointmentBooked { appointment } => {
                if appointment.status.holds_slot()
                    && let Some(ledger) = ledger_for(held, appointment.day_key())
                {
                    ledger.insert(Booking {
                        appointment_id: appointment.id,
                        range: appointment.range,
                    });
                }
                self.by_owner
                    .entry(appointment.user_id)
                    .or_default()
                    .push(appointment.id);
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentRescheduled {
                id,
                date,
                range,
                modified_at,
            } => {
                if let Some(mut appointment) = self.appointments.get_mut(id) {
                    let from = appointment.day_key();
                    let to = DayKey::new(appointment.service_id, *date);
                    if let Some(ledger) = ledger_for(held, from) {
                        ledger.remove(*id);
                    }
                    if let Some(ledger) = ledger_for(held, to) {
                        ledger.insert(Booking {
                            appointment_id: *id,
                            range: *range,
                        });
                    }
                    appointment.date = *date;
                    appointment.range = *range;
                    appointment.modified_at = Some(*modified_at);
                }
            }
            Event::AppointmentCancelled {
                id,
                reason,
                modified_at,
            } => {
                if let Some(mut appointment) = self.appointments.get_mut(id) {
                    if let Some(ledger) = ledger_for(held, appointment.day_key()) {
                        ledger.remove(*id);
                    }
                    appointment.status = AppointmentStatus::Cancelled;
                    appointment.cancellation_reason = reason.clone();
                    appointment.modified_at = Some(*modified_at);
                }
            }
            Event::AppointmentCompleted { id, modified_at } => {
                if let Some(mut appointment) = self.appointments.get_mut(id) {
                    appointment.status = AppointmentStatus::Completed;
                    appointment.modified_at = Some(*modified_at);
                }
            }
            Event::ReviewSubmitted { review } => {
                self.reviews.insert(review.appointment_id, review.clone());
            }
        }
    }
}

impl Engine {
    /// Open with the system clock and default policy.
    pub fn new(wal_path: PathBuf, notifier: Arc<dyn Notifier>) -> io::Result<Self> {
        Self::open(wal_path, notifier, Arc::new(SystemClock), Policy::default())
    }

    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: Policy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state = State::new();
        // Nobody else can see these ledgers yet, so try_write never contends.
        // blocking_write would panic here when opened from async code.
        for event in &events {
            let ledgers: Vec<SharedDayLedger> = state
                .event_day_keys(event)
                .into_iter()
                .map(|key| state.day_ledger(key))
                .collect();
            let mut guards: Vec<_> = ledgers
                .iter()
                .map(|l| l.try_write().expect("replay: uncontended write"))
                .collect();
            let mut held: Vec<&mut DayLedger> = guards.iter_mut().map(|g| &mut **g).collect();
            state.apply(event, &mut held);
        }

        tracing::info!(
            "replayed {} events: {} services, {} appointments",
            events.len(),
            state.services.len(),
            state.appointments.len()
        );
        Ok(Self {
            state: Arc::new(state),
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            notifier,
            clock,
            policy,
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub(super) fn now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }

    /// Day ledger for `key`, created on first use.
    pub(super) fn day_ledger(&self, key: DayKey) -> SharedDayLedger {
        self.state.day_ledger(key)
    }

    /// Day ledger for `key` if anything was ever booked there.
    pub(super) fn existing_day_ledger(&self, key: &DayKey) -> Option<SharedDayLedger> {
        self.state.days.get(key).map(|e| e.value().clone())
    }

    /// Commit then apply, holding `guards` until both are done. If the WAL
    /// refuses the event nothing is applied, which is the rollback.
    ///
    /// The pair runs on its own task: once the append is queued it will be
    /// durable, so the apply must happen even if our caller is dropped.
    pub(super) async fn persist_and_apply(
        &self,
        event: Event,
        mut guards: Vec<OwnedRwLockWriteGuard<DayLedger>>,
    ) -> Result<(), EngineError> {
        let state = self.state.clone();
        let wal_tx = self.wal_tx.clone();
        let gate = self.commit_gate.clone();
        let commit = tokio::spawn(async move {
            let _gate = gate.read_owned().await;
            wal_append(&wal_tx, &event).await?;
            let mut held: Vec<&mut DayLedger> = guards.iter_mut().map(|g| &mut **g).collect();
            state.apply(&event, &mut held);
            Ok::<(), EngineError>(())
        });
        commit
            .await
            .map_err(|e| EngineError::DependencyFailure(format!("commit task failed: {e}")))?
    }

    /// Write-lock the day an appointment currently sits on. Retries if a
    /// concurrent reschedule moves it while we wait for the lock.
    pub(super) async fn lock_appointment_day(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DayLedger>, EngineError> {
        loop {
            let key = self
                .state
                .appointments
                .get(id)
                .map(|a| a.day_key())
                .ok_or(EngineError::NotFound(Entity::Appointment, *id))?;
            let guard = self.day_ledger(key).write_owned().await;
            if self
                .state
                .appointments
                .get(id)
                .is_some_and(|a| a.day_key() == key)
            {
                return Ok(guard);
            }
        }
    }

    /// Write-lock several days in sorted key order so concurrent multi-day
    /// operations cannot deadlock.
    pub(super) async fn lock_days(&self, keys: &[DayKey]) -> Vec<OwnedRwLockWriteGuard<DayLedger>> {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.day_ledger(key).write_owned().await);
        }
        guards
    }

    /// Deliver a notice in the background. The booking that produced it is
    /// already committed and does not wait on the notifier.
    pub(super) fn dispatch(&self, notice: Notice) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            deliver(notifier.as_ref(), &notice).await;
        });
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut categories: Vec<Category> =
            self.state.categories.iter().map(|e| e.value().clone()).collect();
        categories.sort_by_key(|c| c.id);
        let mut services: Vec<Service> =
            self.state.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        let mut appointments: Vec<Appointment> =
            self.state.appointments.iter().map(|e| e.value().clone()).collect();
        appointments.sort_by_key(|a| a.id);
        let mut reviews: Vec<Review> =
            self.state.reviews.iter().map(|e| e.value().clone()).collect();
        reviews.sort_by_key(|r| r.id);

        let mut events = Vec::with_capacity(
            categories.len() + services.len() + appointments.len() + reviews.len(),
        );
        events.extend(categories.into_iter().map(|c| Event::CategoryCreated {
            id: c.id,
            name: c.name,
            description: c.description,
        }));
        events.extend(services.into_iter().map(|service| Event::ServiceCreated { service }));
        events.extend(
            appointments
                .into_iter()
                .map(|appointment| Event::AppointmentBooked { appointment }),
        );
        events.extend(reviews.into_iter().map(|review| Event::ReviewSubmitted { review }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::DependencyFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::DependencyFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::DependencyFailure(e.to_string()))
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

    /// Point the engine at a writer that is gone, so every commit fails.
    #[cfg(test)]
    pub(crate) fn disconnect_wal(&mut self) {
        let (tx, _) = mpsc::channel(1);
        self.wal_tx = tx;
    }
}
