use chrono::NaiveTime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::resolve_day;
use super::conflict::{check_bookable, check_no_conflict, now_ms, validate_start};
use super::duration::{total_minutes, resolve_lines};
use super::{apply_to_day, move_appointment, Engine, EngineError, WalCommand};

pub(super) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidArgument(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(super) fn validate_phone(phone: Option<&str>) -> Result<(), EngineError> {
    if phone.is_some_and(|p| p.len() > MAX_PHONE_LEN) {
        return Err(EngineError::LimitExceeded("phone too long"));
    }
    Ok(())
}

fn validate_hours(start: NaiveTime, end: NaiveTime, what: &str) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidArgument(format!("{what}: start must be before end")));
    }
    Ok(())
}

impl Engine {
    // ── Configuration ────────────────────────────────────────

    pub async fn update_settings(
        &self,
        display_name: Option<String>,
        slot_minutes: u32,
        lead_minutes: u32,
    ) -> Result<TenantSettings, EngineError> {
        if let Some(name) = &display_name {
            validate_name(name, "display name")?;
        }
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) || 60 % slot_minutes != 0 {
            return Err(EngineError::InvalidArgument(format!(
                "slot_minutes must divide 60 and lie in {MIN_SLOT_MINUTES}..={MAX_SLOT_MINUTES}"
            )));
        }
        if lead_minutes > MAX_LEAD_MINUTES {
            return Err(EngineError::LimitExceeded("lead time too long"));
        }
        let settings = TenantSettings {
            display_name,
            slot_minutes,
            lead_minutes,
        };
        let mut config = self.config.write().await;
        let event = Event::SettingsUpdated { settings: settings.clone() };
        self.persist_config(&mut config, &event).await?;
        Ok(settings)
    }

    pub async fn set_weekly_hours(
        &self,
        professional_id: Option<Ulid>,
        hours: WeeklyHours,
    ) -> Result<(), EngineError> {
        if !hours.day_off {
            validate_hours(hours.start, hours.end, "weekly hours")?;
        }
        let mut config = self.config.write().await;
        if let Some(pid) = professional_id
            && !config.professionals.contains_key(&pid)
        {
            return Err(EngineError::NotFound(pid));
        }
        let event = Event::WeeklyHoursSet { professional_id, hours };
        self.persist_config(&mut config, &event).await
    }

    pub async fn set_lunch_break(&self, lunch: LunchBreak) -> Result<(), EngineError> {
        if lunch.active {
            validate_hours(lunch.start, lunch.end, "lunch break")?;
        }
        let mut config = self.config.write().await;
        let event = Event::LunchBreakSet { lunch };
        self.persist_config(&mut config, &event).await
    }

    /// Insert or replace the special day for `day.date`.
    pub async fn upsert_special_day(&self, day: SpecialDay) -> Result<(), EngineError> {
        if !day.day_off {
            match (day.start, day.end) {
                (Some(start), Some(end)) => validate_hours(start, end, "special day")?,
                _ => {
                    return Err(EngineError::InvalidArgument(
                        "special day needs start and end unless it is a day off".into(),
                    ));
                }
            }
        }
        let mut config = self.config.write().await;
        if config.special_day_by_id(&day.id).is_some_and(|d| d.date != day.date) {
            return Err(EngineError::AlreadyExists(day.id));
        }
        if !config.special_days.contains_key(&day.date)
            && config.special_days.len() >= MAX_SPECIAL_DAYS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many special days"));
        }
        let event = Event::SpecialDaySet { day };
        self.persist_config(&mut config, &event).await
    }

    pub async fn remove_special_day(&self, id: Ulid) -> Result<(), EngineError> {
        let mut config = self.config.write().await;
        if config.special_day_by_id(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::SpecialDayRemoved { id };
        self.persist_config(&mut config, &event).await
    }

    pub async fn save_offering(&self, offering: Offering) -> Result<(), EngineError> {
        validate_name(&offering.name, "offering name")?;
        if offering.minutes == 0 {
            return Err(EngineError::InvalidArgument("offering minutes must be positive".into()));
        }
        if offering.minutes > MAX_OFFERING_MINUTES {
            return Err(EngineError::LimitExceeded("offering too long"));
        }
        if offering.price_cents < 0 {
            return Err(EngineError::InvalidArgument("price must not be negative".into()));
        }
        let mut config = self.config.write().await;
        if !config.offerings.contains_key(&offering.id)
            && config.offerings.len() >= MAX_OFFERINGS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many offerings"));
        }
        let event = Event::OfferingSaved { offering };
        self.persist_config(&mut config, &event).await
    }

    pub async fn remove_offering(&self, id: Ulid) -> Result<(), EngineError> {
        let mut config = self.config.write().await;
        if !config.offerings.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::OfferingRemoved { id };
        self.persist_config(&mut config, &event).await
    }

    pub async fn save_professional(&self, professional: Professional) -> Result<(), EngineError> {
        validate_name(&professional.name, "professional name")?;
        if let Some(login) = &professional.login {
            validate_name(login, "login")?;
        }
        let mut config = self.config.write().await;
        if !config.professionals.contains_key(&professional.id)
            && config.professionals.len() >= MAX_PROFESSIONALS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        if let Some(missing) = professional
            .excluded_offering_ids
            .iter()
            .find(|id| !config.offerings.contains_key(id))
        {
            return Err(EngineError::NotFound(*missing));
        }
        let event = Event::ProfessionalSaved { professional };
        self.persist_config(&mut config, &event).await
    }

    /// Removes the professional and their weekly hours. Existing appointments keep the id.
    pub async fn remove_professional(&self, id: Ulid) -> Result<(), EngineError> {
        let mut config = self.config.write().await;
        if !config.professionals.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ProfessionalRemoved { id };
        self.persist_config(&mut config, &event).await
    }

    // ── Booking ──────────────────────────────────────────────

    /// Validate and persist a new appointment.
    ///
    /// Duration is always recomputed from the catalog. The day write lock is
    /// held across the conflict check, WAL append and apply, so of two
    /// racing commits for one interval exactly one succeeds.
    pub async fn commit_booking(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        validate_name(&req.client_name, "client name")?;
        validate_phone(req.phone.as_deref())?;
        validate_start(req.start)?;
        let date = ms_date(req.start)
            .ok_or_else(|| EngineError::InvalidArgument("invalid start".into()))?;

        let config = self.config.read().await;
        if config.offerings.is_empty() {
            return Err(EngineError::ConfigurationMissing);
        }
        let professional = match req.professional_id {
            Some(pid) => Some(config.professionals.get(&pid).ok_or(EngineError::NotFound(pid))?),
            None => None,
        };
        let lines = resolve_lines(&config.offerings, &req.lines, professional)?;
        let minutes = total_minutes(&lines);
        if minutes == 0 {
            return Err(EngineError::InvalidArgument("booking has no duration".into()));
        }

        let span = Span::from_minutes(req.start, minutes);
        let windows = resolve_day(&config, date, req.professional_id);
        let earliest = now_ms() + Ms::from(config.settings.lead_minutes) * MINUTE_MS;

        let mut guard = self.day_book(date).write_owned().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this day"));
        }
        if let Err(e) = check_bookable(&windows, &guard, &span, req.professional_id, None, earliest) {
            if let EngineError::SlotConflict { conflicting } = &e {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!("booking {} rejected: overlaps {conflicting}", req.id);
            }
            return Err(e);
        }

        // Reserve the id; released again if the WAL append fails.
        match self.appointment_dates.entry(req.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(date);
            }
        }

        let appointment = Appointment {
            id: req.id,
            professional_id: req.professional_id,
            client_name: req.client_name,
            phone: req.phone,
            start: req.start,
            minutes,
            lines,
            status: AppointmentStatus::Active,
            payment_method: None,
            credit_id: None,
        };
        let event = Event::AppointmentBooked { appointment: appointment.clone() };
        if let Err(e) = self.persist_day(&mut guard, &event).await {
            self.appointment_dates.remove(&req.id);
            return Err(e);
        }
        info!(
            "booked {} on {date} at {} for {minutes} min",
            appointment.id,
            time_label(appointment.start)
        );
        Ok(appointment)
    }

    /// Active → Completed. Amended lines replace the booked ones without an
    /// overlap re-check. Paying with `Fiado` opens a credit for the total once
    /// the completion is durable; a credit failure is reported, not rolled back.
    pub async fn complete_appointment(
        &self,
        id: Ulid,
        amended_lines: Option<Vec<LineItem>>,
        payment_method: PaymentMethod,
    ) -> Result<Completion, EngineError> {
        let config = self.config.read().await;
        let mut guard = self.lock_appointment_day(&id).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            return Err(EngineError::InvalidStateTransition { id, status: current.status });
        }

        let lines = match amended_lines {
            Some(lines) => {
                let professional = current
                    .professional_id
                    .and_then(|pid| config.professionals.get(&pid));
                let booked = resolve_lines(&config.offerings, &lines, professional)?;
                let minutes = total_minutes(&booked);
                if minutes == 0 {
                    return Err(EngineError::InvalidArgument("amended lines have no duration".into()));
                }
                // A longer amendment must still fit before the next appointment.
                let span = Span::from_minutes(current.start, minutes);
                if let Err(e) = check_no_conflict(&guard, &span, current.professional_id, Some(id)) {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    debug!("completion of {id} rejected: amended lines overlap");
                    return Err(e);
                }
                Some(booked)
            }
            None => None,
        };

        let event = Event::AppointmentCompleted { id, lines, payment_method };
        self.persist_day(&mut guard, &event).await?;
        let appointment = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        info!("completed {id} paid with {}", payment_method.as_str());

        let mut outcome = Completion {
            appointment,
            credit: None,
            credit_error: None,
        };
        if payment_method != PaymentMethod::Fiado {
            return Ok(outcome);
        }

        let total = outcome.appointment.price_cents();
        if total <= 0 {
            warn!("completed {id} on credit with a zero total; no credit opened");
            return Ok(outcome);
        }
        match self.open_credit_for(&outcome.appointment, total).await {
            Ok(credit) => {
                if let Some(a) = guard.get_mut(&id) {
                    a.credit_id = Some(credit.id);
                }
                outcome.appointment.credit_id = Some(credit.id);
                outcome.credit = Some(credit);
            }
            Err(e) => {
                warn!("credit for completed appointment {id} failed: {e}");
                metrics::counter!(crate::observability::CREDIT_FAILURES_TOTAL).increment(1);
                outcome.credit_error = Some(e.to_string());
            }
        }
        Ok(outcome)
    }

    /// Active → Cancelled. The freed interval is bookable immediately.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let _config = self.config.read().await;
        let mut guard = self.lock_appointment_day(&id).await?;
        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            return Err(EngineError::InvalidStateTransition { id, status: current.status });
        }
        let event = Event::AppointmentCancelled { id };
        self.persist_day(&mut guard, &event).await?;
        info!("cancelled {id}");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move an active appointment, validated exactly like a fresh commit
    /// (ignoring the appointment itself). Both day books are locked in date order.
    pub async fn reschedule_appointment(&self, id: Ulid, start: Ms) -> Result<Appointment, EngineError> {
        validate_start(start)?;
        let new_date =
            ms_date(start).ok_or_else(|| EngineError::InvalidArgument("invalid start".into()))?;
        let config = self.config.read().await;

        loop {
            let old_date = self.appointment_date(&id).ok_or(EngineError::NotFound(id))?;
            let (mut old_guard, mut new_guard) = if old_date == new_date {
                (self.day_book(old_date).write_owned().await, None)
            } else if old_date < new_date {
                let old = self.day_book(old_date).write_owned().await;
                let new = self.day_book(new_date).write_owned().await;
                (old, Some(new))
            } else {
                let new = self.day_book(new_date).write_owned().await;
                let old = self.day_book(old_date).write_owned().await;
                (old, Some(new))
            };

            let Some(current) = old_guard.get(&id).cloned() else {
                if self.appointment_date(&id) == Some(old_date) {
                    return Err(EngineError::NotFound(id));
                }
                continue; // moved while we waited
            };
            if !current.is_active() {
                return Err(EngineError::InvalidStateTransition { id, status: current.status });
            }

            let span = Span::from_minutes(start, current.minutes);
            let windows = resolve_day(&config, new_date, current.professional_id);
            let earliest = now_ms() + Ms::from(config.settings.lead_minutes) * MINUTE_MS;
            let target = new_guard.as_deref().unwrap_or(&*old_guard);
            if target.appointments.len() >= MAX_APPOINTMENTS_PER_DAY && new_guard.is_some() {
                return Err(EngineError::LimitExceeded("too many appointments on this day"));
            }
            if let Err(e) = check_bookable(&windows, target, &span, current.professional_id, Some(id), earliest) {
                if matches!(e, EngineError::SlotConflict { .. }) {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }

            let event = Event::AppointmentRescheduled { id, start };
            self.wal_append(&event).await?;
            let updated = match new_guard.as_mut() {
                None => {
                    apply_to_day(&mut old_guard, &event);
                    old_guard.get(&id).cloned()
                }
                Some(new_book) => {
                    move_appointment(&mut old_guard, new_book, id, start);
                    self.appointment_dates.insert(id, new_date);
                    new_book.get(&id).cloned()
                }
            };
            info!("rescheduled {id} from {old_date} to {new_date} {}", time_label(start));
            return updated.ok_or(EngineError::NotFound(id));
        }
    }

    /// Hard removal regardless of status.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _config = self.config.read().await;
        let mut guard = self.lock_appointment_day(&id).await?;
        let event = Event::AppointmentDeleted { id };
        self.persist_day(&mut guard, &event).await?;
        self.appointment_dates.remove(&id);
        info!("deleted {id}");
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Holding the config write lock freezes every mutation until the swap is done.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let config = self.config.write().await;
        let mut events = vec![Event::SettingsUpdated { settings: config.settings.clone() }];

        for offering in config.offerings.values() {
            events.push(Event::OfferingSaved { offering: offering.clone() });
        }
        for professional in config.professionals.values() {
            events.push(Event::ProfessionalSaved { professional: professional.clone() });
        }
        let mut weekly: Vec<_> = config.weekly.iter().collect();
        weekly.sort_by_key(|((owner, weekday), _)| (*owner, weekday.num_days_from_monday()));
        for ((owner, _), hours) in weekly {
            events.push(Event::WeeklyHoursSet { professional_id: *owner, hours: hours.clone() });
        }
        events.push(Event::LunchBreakSet { lunch: config.lunch.clone() });
        for day in config.special_days.values() {
            events.push(Event::SpecialDaySet { day: day.clone() });
        }

        let mut dates: Vec<_> = self.days.iter().map(|e| *e.key()).collect();
        dates.sort();
        for date in dates {
            let Some(book) = self.get_day(&date) else { continue };
            let guard = book.read().await;
            for appointment in &guard.appointments {
                events.push(Event::AppointmentBooked { appointment: appointment.clone() });
            }
        }

        let credits = self.credits.lock().await;
        for credit in credits.values() {
            events.push(Event::CreditOpened { credit: credit.clone() });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
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
}
