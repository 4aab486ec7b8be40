use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use crate::model::*;

use super::slots::subtract_intervals;

pub const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Everything a tenant configures: schedule rules and catalog.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub settings: TenantSettings,
    /// Keyed by (professional or tenant-level, weekday). Upsert replaces.
    pub weekly: HashMap<(Option<Ulid>, Weekday), WeeklyHours>,
    pub lunch: LunchBreak,
    pub special_days: BTreeMap<NaiveDate, SpecialDay>,
    pub offerings: BTreeMap<Ulid, Offering>,
    pub professionals: BTreeMap<Ulid, Professional>,
}

impl TenantConfig {
    pub fn new(slot_minutes: u32) -> Self {
        Self {
            settings: TenantSettings {
                display_name: None,
                slot_minutes,
                lead_minutes: 0,
            },
            weekly: HashMap::new(),
            lunch: LunchBreak {
                active: false,
                start: hm(12, 0),
                end: hm(13, 0),
            },
            special_days: BTreeMap::new(),
            offerings: BTreeMap::new(),
            professionals: BTreeMap::new(),
        }
    }

    pub fn special_day_by_id(&self, id: &Ulid) -> Option<&SpecialDay> {
        self.special_days.values().find(|d| d.id == *id)
    }
}

/// Events that bring a brand-new tenant to its default schedule:
/// Monday to Saturday 08:00-18:00, Sunday off, inactive lunch 12:00-13:00.
pub fn seed_events(slot_minutes: u32) -> Vec<Event> {
    let mut events = Vec::with_capacity(9);
    events.push(Event::SettingsUpdated {
        settings: TenantConfig::new(slot_minutes).settings,
    });
    for weekday in ALL_WEEKDAYS {
        events.push(Event::WeeklyHoursSet {
            professional_id: None,
            hours: WeeklyHours {
                weekday,
                start: hm(8, 0),
                end: hm(18, 0),
                day_off: weekday == Weekday::Sun,
            },
        });
    }
    events.push(Event::LunchBreakSet {
        lunch: LunchBreak {
            active: false,
            start: hm(12, 0),
            end: hm(13, 0),
        },
    });
    events
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// Effective opening windows of one date.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DayWindows {
    /// Chronological, non-overlapping, lunch already removed.
    pub open: Vec<Span>,
}

impl DayWindows {
    pub fn is_closed(&self) -> bool {
        self.open.is_empty()
    }

    /// True if `span` lies entirely inside one open window.
    pub fn admits(&self, span: &Span) -> bool {
        self.open.iter().any(|w| w.contains_span(span))
    }
}

/// Resolve the open intervals of `date` for a professional (or the tenant).
///
/// A special day wins over weekly hours. Otherwise the professional's entry for
/// that weekday is used if present, else the tenant's. An active lunch break is
/// cut out of whatever remains, including professional hours.
pub fn resolve_day(config: &TenantConfig, date: NaiveDate, professional: Option<Ulid>) -> DayWindows {
    let hours = match config.special_days.get(&date) {
        Some(special) => {
            if special.day_off {
                return DayWindows::default();
            }
            match (special.start, special.end) {
                (Some(start), Some(end)) if start < end => (start, end),
                _ => return DayWindows::default(),
            }
        }
        None => {
            let weekday = date.weekday();
            let entry = professional
                .and_then(|p| config.weekly.get(&(Some(p), weekday)))
                .or_else(|| config.weekly.get(&(None, weekday)));
            match entry {
                Some(h) if !h.day_off && h.start < h.end => (h.start, h.end),
                _ => return DayWindows::default(),
            }
        }
    };

    let window = Span::new(wall_ms(date, hours.0), wall_ms(date, hours.1));
    let lunch = (config.lunch.active && config.lunch.start < config.lunch.end)
        .then(|| Span::new(wall_ms(date, config.lunch.start), wall_ms(date, config.lunch.end)));

    let open = match lunch {
        Some(l) => subtract_intervals(&[window], &[l]),
        None => vec![window],
    };

    DayWindows { open }
}
