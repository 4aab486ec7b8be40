mod calendar;
mod conflict;
mod credits;
mod duration;
mod error;
mod mutations;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use credits::NewCredit;
pub use calendar::{resolve_day, seed_events, DayWindows, TenantConfig, ALL_WEEKDAYS};
pub use duration::{resolve_lines, total_minutes};
pub use error::EngineError;
pub use slots::{generate_slots, merge_overlapping, subtract_intervals};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDayBook = Arc<RwLock<DayBook>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Batch = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

fn commit_batch(wal: &mut Wal, batch: &mut Batch) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One tenant's scheduling state.
///
/// Lock order is always `config`, then day books in ascending date order, then
/// `credits`. Every mutation takes `config` first, so compaction can freeze the
/// tenant by holding it for write.
pub struct Engine {
    pub slug: String,
    pub(super) config: RwLock<TenantConfig>,
    pub(super) days: DashMap<NaiveDate, SharedDayBook>,
    /// Reverse lookup: appointment id → the date its day book is filed under.
    pub(super) appointment_dates: DashMap<Ulid, NaiveDate>,
    pub(super) credits: Mutex<BTreeMap<Ulid, Credit>>,
    /// Cap on stored credits; `MAX_OPEN_CREDITS` outside tests.
    pub(super) credit_limit: usize,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

#[cfg(test)]
impl Engine {
    pub(crate) fn with_credit_limit(mut self, limit: usize) -> Self {
        self.credit_limit = limit;
        self
    }
}

/// Apply a configuration event (caller holds the config write lock).
fn apply_to_config(config: &mut TenantConfig, event: &Event) {
    match event {
        Event::SettingsUpdated { settings } => config.settings = settings.clone(),
        Event::WeeklyHoursSet { professional_id, hours } => {
            config.weekly.insert((*professional_id, hours.weekday), hours.clone());
        }
        Event::LunchBreakSet { lunch } => config.lunch = lunch.clone(),
        Event::SpecialDaySet { day } => {
            config.special_days.insert(day.date, day.clone());
        }
        Event::SpecialDayRemoved { id } => config.special_days.retain(|_, d| d.id != *id),
        Event::OfferingSaved { offering } => {
            config.offerings.insert(offering.id, offering.clone());
        }
        Event::OfferingRemoved { id } => {
            config.offerings.remove(id);
        }
        Event::ProfessionalSaved { professional } => {
            config.professionals.insert(professional.id, professional.clone());
        }
        Event::ProfessionalRemoved { id } => {
            config.professionals.remove(id);
            config.weekly.retain(|(owner, _), _| *owner != Some(*id));
        }
        _ => {}
    }
}

/// Apply an appointment event that stays within one day book.
fn apply_to_day(book: &mut DayBook, event: &Event) {
    match event {
        Event::AppointmentBooked { appointment } => book.insert(appointment.clone()),
        Event::AppointmentCompleted { id, lines, payment_method } => {
            if let Some(a) = book.get_mut(id) {
                a.status = AppointmentStatus::Completed;
                a.payment_method = Some(*payment_method);
                if let Some(lines) = lines {
                    a.minutes = lines.iter().map(BookedLine::minutes).sum();
                    a.lines = lines.clone();
                }
            }
        }
        Event::AppointmentCancelled { id } => {
            if let Some(a) = book.get_mut(id) {
                a.status = AppointmentStatus::Cancelled;
            }
        }
        Event::AppointmentRescheduled { id, start } => {
            if let Some(mut a) = book.remove(*id) {
                a.start = *start;
                book.insert(a);
            }
        }
        Event::AppointmentDeleted { id } => {
            book.remove(*id);
        }
        _ => {}
    }
}

/// Apply a credit ledger event (caller holds the credits lock).
fn apply_to_credits(credits: &mut BTreeMap<Ulid, Credit>, event: &Event) {
    match event {
        Event::CreditOpened { credit } => {
            credits.insert(credit.id, credit.clone());
        }
        Event::CreditPaid { credit_id, payment } => {
            if let Some(c) = credits.get_mut(credit_id) {
                c.remaining_cents -= payment.amount_cents;
                c.payments.push(payment.clone());
            }
        }
        Event::CreditRemoved { id } => {
            credits.remove(id);
        }
        _ => {}
    }
}

/// Move an appointment between two day books.
fn move_appointment(from: &mut DayBook, to: &mut DayBook, id: Ulid, start: Ms) {
    if let Some(mut a) = from.remove(id) {
        a.start = start;
        to.insert(a);
    }
}

impl Engine {
    /// Open (or create) the tenant at `wal_path`, replaying its log.
    /// A tenant with an empty log is seeded with the default schedule.
    pub fn new(slug: impl Into<String>, wal_path: PathBuf, slot_minutes: u32) -> io::Result<Self> {
        let mut events = Wal::replay(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        if events.is_empty() {
            events = seed_events(slot_minutes);
            for event in &events {
                wal.append_buffered(event)?;
            }
            wal.flush_sync()?;
        }
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slug: slug.into(),
            config: RwLock::new(TenantConfig::new(slot_minutes)),
            days: DashMap::new(),
            appointment_dates: DashMap::new(),
            credits: Mutex::new(BTreeMap::new()),
            credit_limit: crate::limits::MAX_OPEN_CREDITS,
            wal_tx,
        };

        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    // We're the sole owner of every lock during replay, so try_read/try_write
    // always succeed. Never use blocking_* here: replay may run inside an
    // async context (lazy tenant creation).
    fn replay_event(&self, event: &Event) {
        match event {
            Event::SettingsUpdated { .. }
            | Event::WeeklyHoursSet { .. }
            | Event::LunchBreakSet { .. }
            | Event::SpecialDaySet { .. }
            | Event::SpecialDayRemoved { .. }
            | Event::OfferingSaved { .. }
            | Event::OfferingRemoved { .. }
            | Event::ProfessionalSaved { .. }
            | Event::ProfessionalRemoved { .. } => {
                let mut config = self.config.try_write().expect("replay: uncontended write");
                apply_to_config(&mut config, event);
            }
            Event::AppointmentBooked { appointment } => {
                let Some(date) = ms_date(appointment.start) else { return };
                let book = self.day_book(date);
                let mut guard = book.try_write().expect("replay: uncontended write");
                apply_to_day(&mut guard, event);
                self.appointment_dates.insert(appointment.id, date);
            }
            Event::AppointmentRescheduled { id, start } => {
                let Some(old) = self.appointment_date(id) else { return };
                let Some(new) = ms_date(*start) else { return };
                if old == new {
                    let book = self.day_book(old);
                    let mut guard = book.try_write().expect("replay: uncontended write");
                    apply_to_day(&mut guard, event);
                } else {
                    let from = self.day_book(old);
                    let to = self.day_book(new);
                    let mut from = from.try_write().expect("replay: uncontended write");
                    let mut to = to.try_write().expect("replay: uncontended write");
                    move_appointment(&mut from, &mut to, *id, *start);
                    self.appointment_dates.insert(*id, new);
                }
            }
            Event::AppointmentCompleted { id, .. }
            | Event::AppointmentCancelled { id }
            | Event::AppointmentDeleted { id } => {
                let Some(date) = self.appointment_date(id) else { return };
                let book = self.day_book(date);
                let mut guard = book.try_write().expect("replay: uncontended write");
                apply_to_day(&mut guard, event);
                if matches!(event, Event::AppointmentDeleted { .. }) {
                    self.appointment_dates.remove(id);
                }
            }
            Event::CreditOpened { credit } => {
                if let Some(appointment_id) = credit.appointment_id
                    && let Some(date) = self.appointment_date(&appointment_id)
                {
                    let book = self.day_book(date);
                    let mut guard = book.try_write().expect("replay: uncontended write");
                    if let Some(a) = guard.get_mut(&appointment_id) {
                        a.credit_id = Some(credit.id);
                    }
                }
                let mut credits = self.credits.try_lock().expect("replay: uncontended lock");
                apply_to_credits(&mut credits, event);
            }
            Event::CreditPaid { .. } | Event::CreditRemoved { .. } => {
                let mut credits = self.credits.try_lock().expect("replay: uncontended lock");
                apply_to_credits(&mut credits, event);
            }
        }
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

    /// Day book for `date`, created empty if absent.
    pub(super) fn day_book(&self, date: NaiveDate) -> SharedDayBook {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayBook::new(date))))
            .clone()
    }

    pub fn get_day(&self, date: &NaiveDate) -> Option<SharedDayBook> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub fn appointment_date(&self, id: &Ulid) -> Option<NaiveDate> {
        self.appointment_dates.get(id).map(|e| *e.value())
    }

    pub(super) async fn persist_config(&self, config: &mut TenantConfig, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_config(config, event);
        Ok(())
    }

    pub(super) async fn persist_day(&self, book: &mut DayBook, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(book, event);
        Ok(())
    }

    pub(super) async fn persist_credit(
        &self,
        credits: &mut BTreeMap<Ulid, Credit>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_credits(credits, event);
        Ok(())
    }

    /// Lookup appointment → date, then acquire that day's write lock.
    /// Retries if the appointment moved to another day while we waited.
    pub(super) async fn lock_appointment_day(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DayBook>, EngineError> {
        loop {
            let date = self.appointment_date(id).ok_or(EngineError::NotFound(*id))?;
            let guard = self.day_book(date).write_owned().await;
            if guard.get(id).is_some() {
                return Ok(guard);
            }
            if self.appointment_date(id) == Some(date) {
                return Err(EngineError::NotFound(*id));
            }
        }
    }
}
