use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest rental a single line may cover.
pub const MAX_SPAN_DURATION_MS: Ms = 5 * 366 * DAY_MS;

pub const MAX_LINES_PER_PRODUCT: usize = 100_000;

/// Lines per booking confirmed in one admission step.
pub const MAX_BATCH_SIZE: usize = 500;

pub const MAX_GRID_WEEKS: u32 = 104;
pub const MAX_GRID_PRODUCTS: usize = 1_000;

pub const WEEK_MS: Ms = 7 * DAY_MS;
