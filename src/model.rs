use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Tenant-local wall-clock milliseconds: the naive local date-time read as if it were UTC.
/// No time zone conversion is ever applied.
pub type Ms = i64;

/// Integer cents. Prices and credit balances never go through floats.
pub type Cents = i64;

pub const MINUTE_MS: Ms = 60_000;

pub fn wall_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

pub fn datetime_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn ms_datetime(ms: Ms) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

pub fn ms_date(ms: Ms) -> Option<NaiveDate> {
    ms_datetime(ms).map(|dt| dt.date())
}

/// `HH:MM` label for a wall-clock instant.
pub fn time_label(ms: Ms) -> String {
    match ms_datetime(ms) {
        Some(dt) => format!("{:02}:{:02}", dt.hour(), dt.minute()),
        None => String::new(),
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span of `minutes` starting at `start`.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + Ms::from(minutes) * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Calendar rules ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub day_off: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunchBreak {
    pub active: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Date-specific override of the weekly schedule (holiday, custom hours).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialDay {
    pub id: Ulid,
    pub date: NaiveDate,
    pub day_off: bool,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub display_name: Option<String>,
    /// Slot granularity. Always divides 60.
    pub slot_minutes: u32,
    /// Minimum minutes between now and the earliest bookable start.
    pub lead_minutes: u32,
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    pub id: Ulid,
    pub name: String,
    pub minutes: u32,
    pub price_cents: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Professional {
    pub id: Ulid,
    pub name: String,
    pub login: Option<String>,
    pub show_in_agenda: bool,
    pub excluded_offering_ids: Vec<Ulid>,
}

impl Professional {
    pub fn can_perform(&self, offering_id: &Ulid) -> bool {
        !self.excluded_offering_ids.contains(offering_id)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetInfo {
    pub name: String,
    pub breed: Option<String>,
}

/// Requested work: a set of offerings repeated `quantity` times, optionally for one pet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub offering_ids: Vec<Ulid>,
    pub quantity: u32,
    pub pet: Option<PetInfo>,
}

impl LineItem {
    pub fn new(offering_ids: Vec<Ulid>) -> Self {
        Self {
            offering_ids,
            quantity: 1,
            pet: None,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn for_pet(mut self, pet: PetInfo) -> Self {
        self.pet = Some(pet);
        self
    }
}

/// Offering as it was priced when the appointment was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferingSnapshot {
    pub id: Ulid,
    pub name: String,
    pub minutes: u32,
    pub price_cents: Cents,
}

impl From<&Offering> for OfferingSnapshot {
    fn from(o: &Offering) -> Self {
        Self {
            id: o.id,
            name: o.name.clone(),
            minutes: o.minutes,
            price_cents: o.price_cents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedLine {
    pub offerings: Vec<OfferingSnapshot>,
    pub quantity: u32,
    pub pet: Option<PetInfo>,
}

impl BookedLine {
    pub fn minutes(&self) -> u32 {
        self.offerings.iter().map(|o| o.minutes).sum::<u32>() * self.quantity
    }

    pub fn price_cents(&self) -> Cents {
        self.offerings.iter().map(|o| o.price_cents).sum::<Cents>() * Cents::from(self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Active => "active",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    DebitCard,
    CreditCard,
    Pix,
    /// Deferred payment: completing with this opens a credit for the total.
    Fiado,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::Pix => "pix",
            PaymentMethod::Fiado => "fiado",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cash" | "dinheiro" => Ok(PaymentMethod::Cash),
            "debit" | "debit_card" | "cartao_debito" => Ok(PaymentMethod::DebitCard),
            "credit_card" | "cartao_credito" => Ok(PaymentMethod::CreditCard),
            "pix" => Ok(PaymentMethod::Pix),
            "fiado" | "deferred" => Ok(PaymentMethod::Fiado),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub professional_id: Option<Ulid>,
    pub client_name: String,
    pub phone: Option<String>,
    pub start: Ms,
    /// Derived from `lines`; stored so replays never depend on the current catalog.
    pub minutes: u32,
    pub lines: Vec<BookedLine>,
    pub status: AppointmentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub credit_id: Option<Ulid>,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.minutes)
    }

    pub fn is_active(&self) -> bool {
        self.status == AppointmentStatus::Active
    }

    /// Completed appointments keep their interval; only cancellation frees it.
    pub fn occupies(&self) -> bool {
        self.status != AppointmentStatus::Cancelled
    }

    pub fn price_cents(&self) -> Cents {
        self.lines.iter().map(BookedLine::price_cents).sum()
    }
}

/// Unassigned appointments share one calendar with every professional.
pub fn scopes_intersect(a: Option<Ulid>, b: Option<Ulid>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// A booking request before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub professional_id: Option<Ulid>,
    pub client_name: String,
    pub phone: Option<String>,
    pub start: Ms,
    pub lines: Vec<LineItem>,
}

/// All appointments of one calendar day, sorted by `start`.
#[derive(Debug, Clone)]
pub struct DayBook {
    pub date: NaiveDate,
    pub appointments: Vec<Appointment>,
}

impl DayBook {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.start, |a| a.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Non-cancelled appointments whose span overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.occupies() && a.span().end > query.start)
    }

    /// Spans that block a booking in `scope`, sorted by start.
    pub fn blocking_spans(&self, scope: Option<Ulid>, exclude: Option<Ulid>) -> Vec<Span> {
        self.appointments
            .iter()
            .filter(|a| a.occupies())
            .filter(|a| Some(a.id) != exclude)
            .filter(|a| scopes_intersect(scope, a.professional_id))
            .map(Appointment::span)
            .collect()
    }
}

// ── Credits ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPayment {
    pub id: Ulid,
    pub amount_cents: Cents,
    pub method: Option<String>,
    pub paid_at: Ms,
}

/// Deferred-payment balance ("fiado").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub id: Ulid,
    pub client_name: String,
    pub phone: Option<String>,
    pub appointment_id: Option<Ulid>,
    pub description: Option<String>,
    pub original_cents: Cents,
    pub remaining_cents: Cents,
    pub payments: Vec<CreditPayment>,
    pub created_at: Ms,
}

impl Credit {
    pub fn is_paid_off(&self) -> bool {
        self.remaining_cents == 0
    }
}

// ── WAL record ───────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated {
        settings: TenantSettings,
    },
    WeeklyHoursSet {
        professional_id: Option<Ulid>,
        hours: WeeklyHours,
    },
    LunchBreakSet {
        lunch: LunchBreak,
    },
    SpecialDaySet {
        day: SpecialDay,
    },
    SpecialDayRemoved {
        id: Ulid,
    },
    OfferingSaved {
        offering: Offering,
    },
    OfferingRemoved {
        id: Ulid,
    },
    ProfessionalSaved {
        professional: Professional,
    },
    ProfessionalRemoved {
        id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentCompleted {
        id: Ulid,
        lines: Option<Vec<BookedLine>>,
        payment_method: PaymentMethod,
    },
    AppointmentCancelled {
        id: Ulid,
    },
    AppointmentRescheduled {
        id: Ulid,
        start: Ms,
    },
    AppointmentDeleted {
        id: Ulid,
    },
    CreditOpened {
        credit: Credit,
    },
    CreditPaid {
        credit_id: Ulid,
        payment: CreditPayment,
    },
    CreditRemoved {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantInfo {
    pub slug: String,
    pub settings: TenantSettings,
    pub offering_count: usize,
    pub professional_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyHoursInfo {
    pub professional_id: Option<Ulid>,
    pub hours: WeeklyHours,
}

/// Result of completing an appointment. A credit failure does not undo the completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub appointment: Appointment,
    pub credit: Option<Credit>,
    pub credit_error: Option<String>,
}
