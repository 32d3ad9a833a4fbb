pub const MAX_SERVICES: usize = 10_000;
pub const MAX_MASTERS: usize = 10_000;
pub const MAX_BOOKINGS: usize = 1_000_000;

pub const MAX_TITLE_LEN: usize = 200;
pub const MIN_MASTER_NAME_LEN: usize = 2;
pub const MAX_MASTER_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_COMMENT_LEN: usize = 1_000;

pub const MAX_EXPERIENCE_YEARS: u8 = 50;

/// A slot can never outlast one day.
pub const MAX_SLOT_DURATION_MINUTES: u32 = 24 * 60;

/// Rows per SELECT response.
pub const MAX_RESULT_ROWS: usize = 10_000;
