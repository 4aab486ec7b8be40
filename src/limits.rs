use crate::model::Ms;

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_OFFERINGS_PER_TENANT: usize = 1_000;
pub const MAX_PROFESSIONALS_PER_TENANT: usize = 500;
pub const MAX_SPECIAL_DAYS_PER_TENANT: usize = 5_000;
pub const MAX_APPOINTMENTS_PER_DAY: usize = 2_000;
pub const MAX_OPEN_CREDITS: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 1_024;

/// Upper bound on line items (offerings × pets) in a single booking.
pub const MAX_LINE_ITEMS: usize = 64;
pub const MAX_OFFERINGS_PER_LINE: usize = 32;
pub const MAX_QUANTITY: u32 = 50;

pub const MAX_OFFERING_MINUTES: u32 = 24 * 60;
pub const MAX_LEAD_MINUTES: u32 = 7 * 24 * 60;
pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 60;

/// 2000-01-01T00:00:00 and 2200-01-01T00:00:00 as wall-clock milliseconds.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
