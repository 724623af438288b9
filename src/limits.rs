/// Slot interval bounds, in minutes.
pub const MIN_INTERVAL_MINUTES: u32 = 20;
pub const MAX_INTERVAL_MINUTES: u32 = 60;

/// Longest service, in slots.
pub const MAX_DURATION_SLOTS: u32 = 24;

pub const MAX_CLOSED_SLOTS_PER_OVERRIDE: usize = 288;
pub const MAX_BOOKINGS_PER_DAY: usize = 512;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_BARBERS: usize = 100_000;
