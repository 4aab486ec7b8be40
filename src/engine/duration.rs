use std::collections::BTreeMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Resolve requested line items into priced snapshots, checking that each
/// offering exists and that the chosen professional performs it.
pub fn resolve_lines(
    catalog: &BTreeMap<Ulid, Offering>,
    lines: &[LineItem],
    professional: Option<&Professional>,
) -> Result<Vec<BookedLine>, EngineError> {
    if lines.len() > MAX_LINE_ITEMS {
        return Err(EngineError::LimitExceeded("too many line items"));
    }
    let mut booked = Vec::with_capacity(lines.len());
    for line in lines {
        if line.quantity == 0 {
            return Err(EngineError::InvalidArgument("quantity must be at least 1".into()));
        }
        if line.quantity > MAX_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        if line.offering_ids.len() > MAX_OFFERINGS_PER_LINE {
            return Err(EngineError::LimitExceeded("too many offerings in one line"));
        }
        let mut offerings = Vec::with_capacity(line.offering_ids.len());
        for id in &line.offering_ids {
            let offering = catalog.get(id).ok_or(EngineError::NotFound(*id))?;
            if let Some(p) = professional
                && !p.can_perform(id)
            {
                return Err(EngineError::OfferingExcluded {
                    offering: *id,
                    professional: p.id,
                });
            }
            offerings.push(OfferingSnapshot::from(offering));
        }
        booked.push(BookedLine {
            offerings,
            quantity: line.quantity,
            pet: line.pet.clone(),
        });
    }
    Ok(booked)
}

/// Total minutes of resolved line items: each line's offerings summed, times its quantity.
pub fn total_minutes(lines: &[BookedLine]) -> u32 {
    lines.iter().map(BookedLine::minutes).sum()
}
