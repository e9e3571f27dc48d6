//! Hard caps on input sizes. Exceeding any of these is a rejected input.

pub const MAX_UNITS: usize = 10_000;
pub const MAX_BLOCKS_PER_UNIT: usize = 20_000;
pub const MAX_GROUP_UNITS: usize = 32;

/// Longest stay that may be booked or quoted.
pub const MAX_STAY_NIGHTS: i64 = 730;

pub const MAX_OTA_NAME_LEN: usize = 50;
pub const MAX_PROPERTY_ID_LEN: usize = 200;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_NOTE_LEN: usize = 1024;

/// Feed event summaries are cut to this many characters when stored as notes.
pub const FEED_NOTE_CHARS: usize = 120;
/// Per-unit sync status messages are cut to this many characters.
pub const SYNC_STATUS_CHARS: usize = 140;

pub const MAX_FEED_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_FEED_EVENTS: usize = 10_000;

pub const MAX_IMPORT_ROWS: usize = 1_000;
