mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod store;

pub use availability::{resolve_schedule, service_end, single_slot_times, start_times};
pub use error::EngineError;
pub use slots::{generate_slots, slot_runs, WindowSlots};
pub use store::{Catalog, Directory};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

pub type SharedBarberState = Arc<RwLock<BarberState>>;

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
///
/// Every append that is already queued when the first one arrives joins the
/// same batch and shares one fsync. A non-append command ends the batch: the
/// batch is flushed first so compaction never races buffered bytes.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut trailing = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    trailing = Some(other);
                    break;
                }
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = trailing {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        if tx.send(r).is_err() {
            tracing::debug!("WAL append acknowledged after its caller went away");
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch does not
    // leak into the next one.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            if response.send(result).is_err() {
                tracing::debug!("compaction finished after its caller went away");
            }
        }
        WalCommand::AppendsSinceCompact { response } => {
            if response.send(wal.appends_since_compact()).is_err() {
                tracing::debug!("append count requested by a caller that went away");
            }
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Booking index ────────────────────────────────────────

/// Booking id → (barber, date), plus user → booking ids.
#[derive(Default)]
pub(super) struct BookingIndex {
    by_id: DashMap<Ulid, (Ulid, NaiveDate)>,
    by_user: DashMap<Ulid, Vec<Ulid>>,
}

impl BookingIndex {
    fn insert(&self, booking: &Booking) {
        self.by_id
            .insert(booking.id, (booking.barber_id, booking.date));
        self.by_user
            .entry(booking.user_id)
            .or_default()
            .push(booking.id);
    }

    fn remove(&self, booking: &Booking) {
        self.by_id.remove(&booking.id);
        if let Some(mut ids) = self.by_user.get_mut(&booking.user_id) {
            ids.retain(|id| *id != booking.id);
        }
    }

    /// Claim `id` for a booking about to be written. False if any barber already holds it.
    pub(super) fn reserve(&self, id: Ulid, barber_id: Ulid, date: NaiveDate) -> bool {
        match self.by_id.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert((barber_id, date));
                true
            }
        }
    }

    /// Undo a [`BookingIndex::reserve`] whose write never landed.
    pub(super) fn release(&self, id: &Ulid) {
        self.by_id.remove(id);
    }

    pub(super) fn locate(&self, id: &Ulid) -> Option<(Ulid, NaiveDate)> {
        self.by_id.get(id).map(|e| *e.value())
    }

    pub(super) fn for_user(&self, user_id: &Ulid) -> Vec<Ulid> {
        self.by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedBarberState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub catalog: Arc<Catalog>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) bookings: BookingIndex,
    /// Writers hold this shared from before they lock a barber until their
    /// event is applied; compaction holds it exclusively.
    pub(super) compaction_gate: RwLock<()>,
    /// Serializes catalog writes so uniqueness checks and their writes are one step.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply a schedule or booking event to one barber (no locking, caller holds the lock).
fn apply_to_barber(bs: &mut BarberState, event: &Event, index: &BookingIndex) {
    match event {
        Event::TemplateConfigured {
            day_of_week, hours, ..
        } => {
            bs.templates.insert(*day_of_week, *hours);
        }
        Event::OverrideSet { date, schedule, .. } => {
            bs.overrides.insert(*date, schedule.clone());
        }
        Event::OverrideRemoved { date, .. } => {
            bs.overrides.remove(date);
        }
        Event::BookingConfirmed { booking } => {
            index.insert(booking);
            bs.insert_booking(booking.clone());
        }
        Event::BookingCancelled { id, date, .. } => {
            if let Some(removed) = bs.remove_booking(*date, *id) {
                index.remove(&removed);
            }
        }
        // Catalog events are applied to the Catalog, not to barber state.
        Event::BarberRegistered { .. }
        | Event::UserRegistered { .. }
        | Event::ServiceUpserted { .. }
        | Event::ServiceRemoved { .. } => {}
    }
}

/// The barber whose state a schedule or booking event changes.
fn event_barber_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TemplateConfigured { barber_id, .. }
        | Event::OverrideSet { barber_id, .. }
        | Event::OverrideRemoved { barber_id, .. }
        | Event::BookingCancelled { barber_id, .. } => Some(*barber_id),
        Event::BookingConfirmed { booking } => Some(booking.barber_id),
        Event::BarberRegistered { .. }
        | Event::UserRegistered { .. }
        | Event::ServiceUpserted { .. }
        | Event::ServiceRemoved { .. } => None,
    }
}

impl Engine {
    /// Open (or create) the WAL at `wal_path`, rebuild state from it, and start
    /// the group-commit writer. Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        Self::build(wal_path, clock, None)
    }

    /// Like [`Engine::new`], but identity and service lookups on the booking
    /// path go to `directory` instead of the built-in catalog.
    pub fn with_directory(
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn Directory>,
    ) -> io::Result<Self> {
        Self::build(wal_path, clock, Some(directory))
    }

    fn build(
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        directory: Option<Arc<dyn Directory>>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let catalog = Arc::new(Catalog::new());
        let directory = directory.unwrap_or_else(|| catalog.clone() as Arc<dyn Directory>);
        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            catalog,
            directory,
            clock,
            bookings: BookingIndex::default(),
            compaction_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
        };

        // Rebuild plain state first; nothing else can see it yet, so no locks.
        let mut barbers: HashMap<Ulid, BarberState> = HashMap::new();
        for event in &events {
            engine.catalog.apply_event(event);
            if let Event::BarberRegistered { id, .. } = event {
                barbers.entry(*id).or_insert_with(|| BarberState::new(*id));
            }
            if let Some(barber_id) = event_barber_id(event) {
                let bs = barbers
                    .entry(barber_id)
                    .or_insert_with(|| BarberState::new(barber_id));
                apply_to_barber(bs, event, &engine.bookings);
            }
        }
        for (id, bs) in barbers {
            engine.state.insert(id, Arc::new(RwLock::new(bs)));
        }

        tracing::debug!(
            "replayed {} events for {} barbers from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );
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
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn get_barber(&self, id: &Ulid) -> Option<SharedBarberState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Barber state for a configuration write. A barber known only to an
    /// external directory gets empty state on first write.
    pub(super) fn barber_for_write(&self, id: &Ulid) -> Result<SharedBarberState, EngineError> {
        if let Some(bs) = self.get_barber(id) {
            return Ok(bs);
        }
        if !self.directory.barber_exists(id) {
            return Err(EngineError::BarberNotFound(*id));
        }
        Ok(self
            .state
            .entry(*id)
            .or_insert_with(|| Arc::new(RwLock::new(BarberState::new(*id))))
            .value()
            .clone())
    }

    /// WAL-append then apply to the locked barber. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        bs: &mut BarberState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_barber(bs, event, &self.bookings);
        Ok(())
    }

    /// WAL-append then apply a catalog event.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.catalog.apply_event(event);
        if let Event::BarberRegistered { id, .. } = event {
            self.state
                .entry(*id)
                .or_insert_with(|| Arc::new(RwLock::new(BarberState::new(*id))));
        }
        Ok(())
    }
}
