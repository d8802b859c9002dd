use crate::model::{DAY, Ms};

pub const MAX_ACTIVITIES_PER_CLUB: usize = 1_000_000;
pub const MAX_CLUBS: usize = 1024;
pub const MAX_CLUB_NAME_LEN: usize = 256;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NOTES_LEN: usize = 2048;
pub const MAX_PARTICIPANTS: u32 = 500;
pub const MAX_TABLES: u32 = 64;

/// 1970-01-01 .. 9999-12-31
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_ACTIVITY_DURATION_MS: Ms = DAY;
pub const MAX_SLOTS_PER_QUERY: usize = 1440;
pub const MAX_RECURRENCE_WEEKS: u32 = 52;
