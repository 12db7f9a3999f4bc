//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract; schedulers and cron wrappers
//! rely on them.
//!
//! | Code | Meaning                                               |
//! |------|-------------------------------------------------------|
//! | 0    | Success                                               |
//! | 2    | Usage error (bad args, unreadable file)               |
//! | 3    | Invalid reconciliation config                         |
//! | 4    | Invalid input (manual entries, vehicle CSV)           |
//! | 5    | Device feed failed; nothing was reconciled            |
//! | 6    | Storage failure outside a per-device write            |
//! | 7    | Another run holds the run lock                        |
//! | 8    | Run completed, but one or more devices failed to save |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant
//! 2. Document what triggers it
//! 3. Update the table above

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// Usage error - bad arguments, missing or unreadable files.
pub const EXIT_USAGE: u8 = 2;

/// Config failed to parse or validate.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// Manual entries or vehicle import rows were rejected.
/// Nothing was written.
pub const EXIT_VALIDATION: u8 = 4;

/// Device discovery failed (timeout, auth, upstream, bad payload).
pub const EXIT_FEED: u8 = 5;

/// Database could not be opened, read or locked for the run.
pub const EXIT_STORAGE: u8 = 6;

/// Another process holds an unexpired run lease.
pub const EXIT_RUN_LOCKED: u8 = 7;

/// The run finished but `errors` is non-empty.
/// Applied mappings are kept; the summary lists the failed devices.
pub const EXIT_DEVICE_ERRORS: u8 = 8;
