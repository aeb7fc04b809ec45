mod conflict;
mod error;
mod expand;
mod intervals;
mod ledger;
mod mutations;
mod queries;

pub use error::EngineError;
pub use expand::{block_on, dates_in_range, expand_availability, unavailable_on};
pub use intervals::{
    block_starts, bookable_starts, free_intervals, merge_overlapping, subtract_intervals,
};
pub use ledger::MemberLedger;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::directory::MemberDirectory;
use crate::model::*;
use crate::policy::SchedulingPolicy;
use crate::wal::Wal;

/// Bookings are partitioned by trainer and date; this is the commit lock scope.
pub type DayKey = (TrainerId, NaiveDate);

pub type SharedTrainerDay = Arc<RwLock<TrainerDay>>;
pub type SharedClassDay = Arc<RwLock<ClassDay>>;
pub type SharedLedger = Arc<Mutex<MemberLedger>>;

// ── State containers ─────────────────────────────────────

/// Templates and products. Small, read on every commit, written rarely.
#[derive(Debug, Default)]
pub struct Catalog {
    pub availability: HashMap<Ulid, AvailabilityTemplate>,
    pub unavailability: HashMap<Ulid, UnavailabilityTemplate>,
    pub products: HashMap<Ulid, SessionProduct>,
}

impl Catalog {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::AvailabilityTemplateSaved { template } => {
                self.availability.insert(template.id, template.clone());
            }
            Event::AvailabilityTemplateRemoved { id } => {
                self.availability.remove(id);
            }
            Event::UnavailabilityTemplateSaved { template } => {
                self.unavailability.insert(template.id, template.clone());
            }
            Event::UnavailabilityTemplateRemoved { id } => {
                self.unavailability.remove(id);
            }
            Event::SessionProductSaved { product } => {
                self.products.insert(product.id, product.clone());
            }
            Event::SessionProductRemoved { id } => {
                self.products.remove(id);
            }
            _ => {}
        }
    }
}

/// Class timetable cells claimed on one date.
#[derive(Debug, Default)]
pub struct ClassDay {
    pub cells: BTreeSet<Minute>,
}

/// Active bookings of one trainer on one date, sorted by start.
#[derive(Debug)]
pub struct TrainerDay {
    pub trainer: TrainerId,
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

impl TrainerDay {
    pub fn new(trainer: TrainerId, date: NaiveDate) -> Self {
        Self {
            trainer,
            date,
            bookings: Vec::new(),
        }
    }

    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| (b.start, b.id) < (booking.start, booking.id));
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    fn mark_docked(&mut self, id: Ulid) {
        if let Some(b) = self.bookings.iter_mut().find(|b| b.id == id)
            && let BookingKind::Open { credit_docked, .. } = &mut b.kind
        {
            *credit_docked = true;
        }
    }
}

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

/// Owns the WAL. Each wake-up drains every append already queued and makes
/// them durable with a single fsync before answering any of them.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
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
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never ride along
    // with the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
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
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// Scheduling and credit-ledger engine for one facility.
///
/// Lock order, outermost first: `gate` → `catalog` → class day → trainer day
/// → member ledger. Every mutation holds `gate` shared; compaction holds it
/// exclusively so the snapshot it writes is consistent.
pub struct Engine {
    pub(super) gate: RwLock<()>,
    pub(super) catalog: RwLock<Catalog>,
    pub(super) class_days: DashMap<NaiveDate, SharedClassDay>,
    pub(super) days: DashMap<DayKey, SharedTrainerDay>,
    /// Trainers that have a day partition on each date.
    pub(super) day_trainers: DashMap<NaiveDate, HashSet<TrainerId>>,
    pub(super) ledgers: DashMap<MemberId, SharedLedger>,
    /// Active booking id → its partition.
    pub(super) booking_index: DashMap<Ulid, DayKey>,
    /// Cancelled booking id → the partition it lived in.
    pub(super) cancelled: DashMap<Ulid, DayKey>,
    /// Booking ids held by an in-flight commit.
    pub(super) pending_ids: DashMap<Ulid, ()>,
    pub(super) directory: Arc<dyn MemberDirectory>,
    pub(super) policy: SchedulingPolicy,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn MemberDirectory>,
        policy: SchedulingPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            gate: RwLock::new(()),
            catalog: RwLock::new(Catalog::default()),
            class_days: DashMap::new(),
            days: DashMap::new(),
            day_trainers: DashMap::new(),
            ledgers: DashMap::new(),
            booking_index: DashMap::new(),
            cancelled: DashMap::new(),
            pending_ids: DashMap::new(),
            directory,
            policy,
            wal_tx,
        };

        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events: {} active bookings, {} members with ledgers",
            events.len(),
            engine.booking_index.len(),
            engine.ledgers.len()
        );

        Ok(engine)
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    /// Apply a logged event during startup. We are the only owner of every
    /// lock here, so `try_*` always succeeds; never block inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::AvailabilityTemplateSaved { .. }
            | Event::AvailabilityTemplateRemoved { .. }
            | Event::UnavailabilityTemplateSaved { .. }
            | Event::UnavailabilityTemplateRemoved { .. }
            | Event::SessionProductSaved { .. }
            | Event::SessionProductRemoved { .. } => {
                self.catalog
                    .try_write()
                    .expect("replay: uncontended write")
                    .apply(event);
            }
            Event::ClassCellClaimed { date, cell } => {
                let day = self.class_day(*date);
                day.try_write()
                    .expect("replay: uncontended write")
                    .cells
                    .insert(*cell);
            }
            Event::ClassCellReleased { date, cell } => {
                let day = self.class_day(*date);
                day.try_write()
                    .expect("replay: uncontended write")
                    .cells
                    .remove(cell);
            }
            Event::BookingCommitted { booking, debit } => {
                let day = self.trainer_day(&booking.trainer, booking.date);
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.apply_commit(&mut guard, booking.clone());
                if let Some(entry) = debit {
                    self.replay_ledger_entry(entry);
                }
            }
            Event::BookingCancelled {
                id,
                trainer,
                date,
                refund,
            } => {
                let day = self.trainer_day(trainer, *date);
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.apply_cancel(&mut guard, *id);
                if let Some(entry) = refund {
                    self.replay_ledger_entry(entry);
                }
            }
            Event::LedgerEntryRecorded { entry } => self.replay_ledger_entry(entry),
            Event::OpenBookingSettled {
                id,
                trainer,
                date,
                dock,
            } => {
                let day = self.trainer_day(trainer, *date);
                day.try_write()
                    .expect("replay: uncontended write")
                    .mark_docked(*id);
                if let Some(entry) = dock {
                    self.replay_ledger_entry(entry);
                }
            }
        }
    }

    fn replay_ledger_entry(&self, entry: &LedgerEntry) {
        let ledger = self.ledger(&entry.member);
        ledger
            .try_lock()
            .expect("replay: uncontended lock")
            .record(entry.clone());
    }

    // ── Partition lookup ─────────────────────────────────

    /// Get or create the class-cell partition for `date`.
    pub(super) fn class_day(&self, date: NaiveDate) -> SharedClassDay {
        self.class_days.entry(date).or_default().value().clone()
    }

    /// Get or create the booking partition for `trainer` on `date`.
    pub(super) fn trainer_day(&self, trainer: &str, date: NaiveDate) -> SharedTrainerDay {
        let key = (trainer.to_string(), date);
        if let Some(day) = self.days.get(&key) {
            return day.value().clone();
        }
        let day = self
            .days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(TrainerDay::new(trainer.to_string(), date))))
            .value()
            .clone();
        self.day_trainers
            .entry(date)
            .or_default()
            .insert(trainer.to_string());
        day
    }

    pub(super) fn existing_trainer_day(&self, trainer: &str, date: NaiveDate) -> Option<SharedTrainerDay> {
        self.days
            .get(&(trainer.to_string(), date))
            .map(|d| d.value().clone())
    }

    /// Booking partitions of every trainer on `date`.
    pub(super) fn trainer_days_on(&self, date: NaiveDate) -> Vec<SharedTrainerDay> {
        let trainers: Vec<TrainerId> = self
            .day_trainers
            .get(&date)
            .map(|t| t.value().iter().cloned().collect())
            .unwrap_or_default();
        trainers
            .iter()
            .filter_map(|t| self.existing_trainer_day(t, date))
            .collect()
    }

    /// Get or create the ledger for `member`.
    pub(super) fn ledger(&self, member: &str) -> SharedLedger {
        if let Some(l) = self.ledgers.get(member) {
            return l.value().clone();
        }
        self.ledgers
            .entry(member.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MemberLedger::new(member.to_string()))))
            .value()
            .clone()
    }

    // ── Apply ────────────────────────────────────────────

    pub(super) fn apply_commit(&self, day: &mut TrainerDay, booking: Booking) {
        self.booking_index
            .insert(booking.id, (day.trainer.clone(), day.date));
        day.insert(booking);
    }

    pub(super) fn apply_cancel(&self, day: &mut TrainerDay, id: Ulid) {
        day.remove(id);
        self.booking_index.remove(&id);
        self.cancelled.insert(id, (day.trainer.clone(), day.date));
    }

    pub(super) fn apply_settled(&self, day: &mut TrainerDay, id: Ulid) {
        day.mark_docked(id);
    }

    // ── WAL ──────────────────────────────────────────────

    /// Write event to WAL via the background group-commit writer.
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

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Holds the gate exclusively, so no mutation interleaves with the snapshot.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
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
        Ok(count)
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        {
            let catalog = self.catalog.read().await;
            let mut availability: Vec<_> = catalog.availability.values().cloned().collect();
            availability.sort_by_key(|t| t.id);
            events.extend(
                availability
                    .into_iter()
                    .map(|template| Event::AvailabilityTemplateSaved { template }),
            );
            let mut unavailability: Vec<_> = catalog.unavailability.values().cloned().collect();
            unavailability.sort_by_key(|t| t.id);
            events.extend(
                unavailability
                    .into_iter()
                    .map(|template| Event::UnavailabilityTemplateSaved { template }),
            );
            let mut products: Vec<_> = catalog.products.values().cloned().collect();
            products.sort_by_key(|p| p.id);
            events.extend(
                products
                    .into_iter()
                    .map(|product| Event::SessionProductSaved { product }),
            );
        }

        let class_days: Vec<(NaiveDate, SharedClassDay)> = self
            .class_days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (date, day) in class_days {
            let guard = day.read().await;
            events.extend(
                guard
                    .cells
                    .iter()
                    .map(|&cell| Event::ClassCellClaimed { date, cell }),
            );
        }

        let days: Vec<SharedTrainerDay> = self.days.iter().map(|e| e.value().clone()).collect();
        for day in days {
            let guard = day.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCommitted {
                booking: b.clone(),
                debit: None,
            }));
        }

        events.extend(self.cancelled.iter().map(|e| {
            let (trainer, date) = e.value().clone();
            Event::BookingCancelled {
                id: *e.key(),
                trainer,
                date,
                refund: None,
            }
        }));

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.lock().await;
            events.extend(
                guard
                    .entries()
                    .iter()
                    .map(|entry| Event::LedgerEntryRecorded {
                        entry: entry.clone(),
                    }),
            );
        }

        events
    }
}
