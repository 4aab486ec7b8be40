use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::calendar::resolve_day;
use super::conflict::now_ms;
use super::duration::{total_minutes, resolve_lines};
use super::slots::generate_slots;
use super::{Engine, EngineError};

impl Engine {
    /// Start times at which `lines` can be booked on `date`.
    ///
    /// A snapshot under read locks only; the commit re-validates. A closed
    /// day yields an empty list.
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        lines: &[LineItem],
        professional_id: Option<Ulid>,
    ) -> Result<Vec<Slot>, EngineError> {
        self.available_slots_at(date, lines, professional_id, now_ms()).await
    }

    pub(super) async fn available_slots_at(
        &self,
        date: NaiveDate,
        lines: &[LineItem],
        professional_id: Option<Ulid>,
        now: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        let config = self.config.read().await;
        if config.offerings.is_empty() {
            return Err(EngineError::ConfigurationMissing);
        }
        let professional = match professional_id {
            Some(pid) => Some(config.professionals.get(&pid).ok_or(EngineError::NotFound(pid))?),
            None => None,
        };
        let minutes = total_minutes(&resolve_lines(&config.offerings, lines, professional)?);
        if minutes == 0 {
            return Err(EngineError::InvalidArgument("no offerings selected".into()));
        }

        let windows = resolve_day(&config, date, professional_id);
        if windows.is_closed() {
            return Ok(Vec::new());
        }

        let blocking = match self.get_day(&date) {
            Some(book) => {
                let guard = book.read().await;
                guard.blocking_spans(professional_id, None)
            }
            None => Vec::new(),
        };
        let earliest = now + Ms::from(config.settings.lead_minutes) * MINUTE_MS;
        let step = Ms::from(config.settings.slot_minutes) * MINUTE_MS;

        Ok(generate_slots(&windows.open, &blocking, Ms::from(minutes) * MINUTE_MS, step, earliest)
            .into_iter()
            .map(|start| Slot {
                start,
                label: time_label(start),
            })
            .collect())
    }

    pub async fn tenant_info(&self) -> TenantInfo {
        let config = self.config.read().await;
        TenantInfo {
            slug: self.slug.clone(),
            settings: config.settings.clone(),
            offering_count: config.offerings.len(),
            professional_count: config.professionals.len(),
        }
    }

    /// Weekly entries of one scope (tenant-level when `professional_id` is None),
    /// Monday first.
    pub async fn weekly_hours(&self, professional_id: Option<Ulid>) -> Vec<WeeklyHoursInfo> {
        let config = self.config.read().await;
        let mut entries: Vec<WeeklyHoursInfo> = config
            .weekly
            .iter()
            .filter(|((owner, _), _)| *owner == professional_id)
            .map(|((owner, _), hours)| WeeklyHoursInfo {
                professional_id: *owner,
                hours: hours.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.hours.weekday.num_days_from_monday());
        entries
    }

    pub async fn lunch_break(&self) -> LunchBreak {
        self.config.read().await.lunch.clone()
    }

    /// Special days in date order.
    pub async fn special_days(&self) -> Vec<SpecialDay> {
        self.config.read().await.special_days.values().cloned().collect()
    }

    /// The catalog, minus what `professional_id` does not perform.
    pub async fn offerings(&self, professional_id: Option<Ulid>) -> Result<Vec<Offering>, EngineError> {
        let config = self.config.read().await;
        let professional = match professional_id {
            Some(pid) => Some(config.professionals.get(&pid).ok_or(EngineError::NotFound(pid))?),
            None => None,
        };
        Ok(config
            .offerings
            .values()
            .filter(|o| professional.is_none_or(|p| p.can_perform(&o.id)))
            .cloned()
            .collect())
    }

    pub async fn professionals(&self, agenda_only: bool) -> Vec<Professional> {
        self.config
            .read()
            .await
            .professionals
            .values()
            .filter(|p| !agenda_only || p.show_in_agenda)
            .cloned()
            .collect()
    }

    /// Every appointment of `date` in start order, any status. With a
    /// professional, only the ones assigned to them.
    pub async fn appointments(&self, date: NaiveDate, professional_id: Option<Ulid>) -> Vec<Appointment> {
        let Some(book) = self.get_day(&date) else {
            return Vec::new();
        };
        let guard = book.read().await;
        guard
            .appointments
            .iter()
            .filter(|a| professional_id.is_none() || a.professional_id == professional_id)
            .cloned()
            .collect()
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        let date = self.appointment_date(id)?;
        let book = self.get_day(&date)?;
        let guard = book.read().await;
        guard.get(id).cloned()
    }
}
