use thiserror::Error;
use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    /// The tenant has no offerings, so nothing can be booked.
    #[error("no offerings configured")]
    ConfigurationMissing,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("offering {offering} is not performed by professional {professional}")]
    OfferingExcluded { offering: Ulid, professional: Ulid },

    #[error("requested time is outside opening hours")]
    OutsideOpeningHours,

    #[error("requested time is before the earliest bookable start")]
    InPast,

    /// The requested interval overlaps a non-cancelled appointment in the same scope.
    #[error("slot conflicts with appointment {conflicting}")]
    SlotConflict { conflicting: Ulid },

    #[error("appointment {id} is {status}")]
    InvalidStateTransition { id: Ulid, status: AppointmentStatus },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::SlotConflict { .. } => "23P01",
            EngineError::InvalidStateTransition { .. } | EngineError::ConfigurationMissing => {
                "55000"
            }
            EngineError::InvalidArgument(_)
            | EngineError::OfferingExcluded { .. }
            | EngineError::OutsideOpeningHours
            | EngineError::InPast => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}
