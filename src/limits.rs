//! Input bounds enforced by the engine before anything reaches the WAL.

/// Names, phones and emails.
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_PRODUCTS_PER_CALENDAR: usize = 1_000;
pub const MAX_ITEMS_PER_RESERVATION: usize = 1_000;

/// Largest WAL record payload. A length prefix above this is treated as
/// corruption. A reservation with the maximum item count stays far below it.
pub const MAX_WAL_RECORD_LEN: usize = 16 * 1024 * 1024;
