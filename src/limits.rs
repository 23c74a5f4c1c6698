use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;

/// Duration used when a service or appointment carries no usable duration.
pub const DEFAULT_DURATION_MINUTES: i64 = 30;

/// Slot lower bound for "today" is rounded up to this many minutes.
pub const SLOT_ALIGNMENT_MINUTES: i64 = 15;

/// How far in the past a requested start may lie before admission rejects it.
pub const ADMISSION_CLOCK_SKEW_MS: Ms = 60_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_BOOKING_DURATION_MINUTES: i64 = 24 * 60;
pub const MAX_TIME_BLOCK_MS: Ms = 366 * 24 * 60 * MINUTE_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 62 * 24 * 60 * MINUTE_MS;

pub const MAX_PROVIDERS_PER_TENANT: usize = 10_000;
pub const MAX_SHIFTS_PER_DAY: usize = 8;
pub const MAX_SERVICES_PER_PROVIDER: usize = 500;
pub const MAX_SERVICES_PER_BOOKING: usize = 20;
pub const MAX_INTERVALS_PER_PROVIDER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
