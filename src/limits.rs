use crate::time::{HOUR, MINUTE, Ms};

pub const MIN_SLOT_DURATION_MS: Ms = 15 * MINUTE;
pub const MAX_SLOT_DURATION_MS: Ms = 4 * HOUR;

/// Widest desired window a client may submit.
pub const MAX_WINDOW_MS: Ms = 366 * 24 * HOUR;

/// Longest configurable negotiation timeout.
pub const MAX_NEGOTIATION_TIMEOUT_MS: Ms = 365 * 24 * HOUR;

pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_CLIENT_ID_LEN: usize = 128;

pub const MAX_SLOTS: usize = 100_000;
pub const MAX_REQUESTS: usize = 100_000;
