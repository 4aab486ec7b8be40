use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{DayWindows, EngineError};

/// Current tenant-local wall-clock time. The server's local zone stands in
/// for the tenant's.
pub(crate) fn now_ms() -> Ms {
    datetime_ms(chrono::Local::now().naive_local())
}

pub(crate) fn validate_start(start: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Reject `span` if it overlaps a non-cancelled appointment whose scope intersects `scope`.
pub(crate) fn check_no_conflict(
    book: &DayBook,
    span: &Span,
    scope: Option<Ulid>,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for existing in book.overlapping(span) {
        if Some(existing.id) == exclude {
            continue;
        }
        if scopes_intersect(scope, existing.professional_id) {
            return Err(EngineError::SlotConflict {
                conflicting: existing.id,
            });
        }
    }
    Ok(())
}

/// Full write-time validation of a booking span. Caller holds the day write lock.
pub(crate) fn check_bookable(
    windows: &DayWindows,
    book: &DayBook,
    span: &Span,
    scope: Option<Ulid>,
    exclude: Option<Ulid>,
    earliest: Ms,
) -> Result<(), EngineError> {
    if !windows.admits(span) {
        return Err(EngineError::OutsideOpeningHours);
    }
    if span.start < earliest {
        return Err(EngineError::InPast);
    }
    check_no_conflict(book, span, scope, exclude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn appt(start: Ms, minutes: u32, professional_id: Option<Ulid>) -> Appointment {
        Appointment {
            id: Ulid::new(),
            professional_id,
            client_name: "client".into(),
            phone: None,
            start,
            minutes,
            lines: vec![],
            status: AppointmentStatus::Active,
            payment_method: None,
            credit_id: None,
        }
    }

    fn book_with(appts: Vec<Appointment>) -> DayBook {
        let mut book = DayBook::new(NaiveDate::from_ymd_opt(2030, 1, 7).unwrap());
        for a in appts {
            book.insert(a);
        }
        book
    }

    #[test]
    fn conflict_names_the_blocking_appointment() {
        let existing = appt(10 * H, 30, None);
        let existing_id = existing.id;
        let book = book_with(vec![existing]);
        match check_no_conflict(&book, &Span::new(10 * H + 15 * M, 10 * H + 45 * M), None, None) {
            Err(EngineError::SlotConflict { conflicting }) => assert_eq!(conflicting, existing_id),
            other => panic!("expected SlotConflict, got {other:?}"),
        }
    }

    #[test]
    fn other_professional_does_not_conflict() {
        let book = book_with(vec![appt(10 * H, 30, Some(Ulid::new()))]);
        let span = Span::new(10 * H, 10 * H + 30 * M);
        assert!(check_no_conflict(&book, &span, Some(Ulid::new()), None).is_ok());
        // An unassigned request collides with everyone.
        assert!(check_no_conflict(&book, &span, None, None).is_err());
    }

    #[test]
    fn excluded_appointment_is_ignored() {
        let existing = appt(10 * H, 30, None);
        let id = existing.id;
        let book = book_with(vec![existing]);
        assert!(check_no_conflict(&book, &Span::new(10 * H, 10 * H + 30 * M), None, Some(id)).is_ok());
    }

    #[test]
    fn bookable_checks_hours_then_earliest() {
        let windows = DayWindows {
            open: vec![Span::new(8 * H, 12 * H)],
        };
        let book = book_with(vec![]);
        assert!(matches!(
            check_bookable(&windows, &book, &Span::new(11 * H + 30 * M, 12 * H + 30 * M), None, None, 0),
            Err(EngineError::OutsideOpeningHours)
        ));
        assert!(matches!(
            check_bookable(&windows, &book, &Span::new(9 * H, 10 * H), None, None, 9 * H + M),
            Err(EngineError::InPast)
        ));
        assert!(check_bookable(&windows, &book, &Span::new(9 * H, 10 * H), None, None, 9 * H).is_ok());
    }

    #[test]
    fn start_range_is_bounded() {
        assert!(validate_start(MIN_VALID_TIMESTAMP_MS - 1).is_err());
        assert!(validate_start(MIN_VALID_TIMESTAMP_MS).is_ok());
        assert!(validate_start(MAX_VALID_TIMESTAMP_MS).is_err());
    }
}
