use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single blocked range may not exceed two years.
pub const MAX_SPAN_DURATION_MS: Ms = 2 * 366 * 86_400_000;

pub const MAX_BLOCKS_PER_PROFILE: usize = 10_000;
pub const MAX_PROFILES: usize = 100_000;
pub const MAX_POOL_SIZE: usize = 64;
pub const MAX_SUBPROJECTS: usize = 32;
pub const MAX_HORIZON_DAYS: u32 = 730;
pub const MAX_CAPTURE_ATTEMPTS: u32 = 10;
/// Upper bound on a single wait between capture attempts.
pub const MAX_CAPTURE_BACKOFF_MS: u64 = 60_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 8_192;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_BREAKDOWN_LINES: usize = 100;
pub const MAX_ANSWERS: usize = 200;
pub const MAX_ANSWER_LEN: usize = 4_096;
pub const MAX_PROFESSIONAL_INPUTS: usize = 100;
pub const MAX_BATCH_SIZE: usize = 1_000;
