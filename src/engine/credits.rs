use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::mutations::{validate_name, validate_phone};
use super::{Engine, EngineError};

/// Fields of a manually opened credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredit {
    pub id: Ulid,
    pub client_name: String,
    pub phone: Option<String>,
    pub description: Option<String>,
    pub amount_cents: Cents,
}

fn describe(appointment: &Appointment) -> String {
    let names: Vec<&str> = appointment
        .lines
        .iter()
        .flat_map(|l| l.offerings.iter().map(|o| o.name.as_str()))
        .collect();
    let mut description = names.join(", ");
    if description.len() > MAX_DESCRIPTION_LEN {
        let cut = (0..=MAX_DESCRIPTION_LEN)
            .rev()
            .find(|i| description.is_char_boundary(*i))
            .unwrap_or(0);
        description.truncate(cut);
    }
    description
}

impl Engine {
    pub async fn open_credit(&self, new: NewCredit) -> Result<Credit, EngineError> {
        validate_name(&new.client_name, "client name")?;
        validate_phone(new.phone.as_deref())?;
        if new.description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if new.amount_cents <= 0 {
            return Err(EngineError::InvalidArgument("credit amount must be positive".into()));
        }
        let _config = self.config.read().await;
        let credit = Credit {
            id: new.id,
            client_name: new.client_name,
            phone: new.phone,
            appointment_id: None,
            description: new.description,
            original_cents: new.amount_cents,
            remaining_cents: new.amount_cents,
            payments: Vec::new(),
            created_at: now_ms(),
        };
        self.insert_credit(credit).await
    }

    /// Credit for a completed appointment. Caller holds the config lock and
    /// the appointment's day lock.
    pub(super) async fn open_credit_for(
        &self,
        appointment: &Appointment,
        total_cents: Cents,
    ) -> Result<Credit, EngineError> {
        let credit = Credit {
            id: Ulid::new(),
            client_name: appointment.client_name.clone(),
            phone: appointment.phone.clone(),
            appointment_id: Some(appointment.id),
            description: Some(describe(appointment)),
            original_cents: total_cents,
            remaining_cents: total_cents,
            payments: Vec::new(),
            created_at: now_ms(),
        };
        self.insert_credit(credit).await
    }

    async fn insert_credit(&self, credit: Credit) -> Result<Credit, EngineError> {
        let mut credits = self.credits.lock().await;
        if credits.contains_key(&credit.id) {
            return Err(EngineError::AlreadyExists(credit.id));
        }
        if credits.len() >= self.credit_limit {
            return Err(EngineError::LimitExceeded("too many credits"));
        }
        let event = Event::CreditOpened { credit: credit.clone() };
        self.persist_credit(&mut credits, &event).await?;
        info!("opened credit {} for {} cents", credit.id, credit.original_cents);
        Ok(credit)
    }

    /// Record a payment against a credit. The payment may not exceed the balance.
    pub async fn add_credit_payment(
        &self,
        payment_id: Ulid,
        credit_id: Ulid,
        amount_cents: Cents,
        method: Option<String>,
    ) -> Result<Credit, EngineError> {
        if amount_cents <= 0 {
            return Err(EngineError::InvalidArgument("payment amount must be positive".into()));
        }
        if method.as_ref().is_some_and(|m| m.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("payment method too long"));
        }
        let _config = self.config.read().await;
        let mut credits = self.credits.lock().await;
        let credit = credits.get(&credit_id).ok_or(EngineError::NotFound(credit_id))?;
        if credit.payments.iter().any(|p| p.id == payment_id) {
            return Err(EngineError::AlreadyExists(payment_id));
        }
        if amount_cents > credit.remaining_cents {
            return Err(EngineError::InvalidArgument(format!(
                "payment of {amount_cents} exceeds remaining balance {}",
                credit.remaining_cents
            )));
        }
        let event = Event::CreditPaid {
            credit_id,
            payment: CreditPayment {
                id: payment_id,
                amount_cents,
                method,
                paid_at: now_ms(),
            },
        };
        self.persist_credit(&mut credits, &event).await?;
        credits.get(&credit_id).cloned().ok_or(EngineError::NotFound(credit_id))
    }

    pub async fn list_credits(&self, pending_only: bool) -> Vec<Credit> {
        let credits = self.credits.lock().await;
        credits
            .values()
            .filter(|c| !pending_only || !c.is_paid_off())
            .cloned()
            .collect()
    }

    pub async fn get_credit(&self, id: &Ulid) -> Option<Credit> {
        self.credits.lock().await.get(id).cloned()
    }

    pub async fn delete_credit(&self, id: Ulid) -> Result<(), EngineError> {
        let _config = self.config.read().await;
        let mut credits = self.credits.lock().await;
        if !credits.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::CreditRemoved { id };
        self.persist_credit(&mut credits, &event).await
    }
}
