//! Error types for usb-gate.

use thiserror::Error;

/// Result type alias using the usb-gate Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the admission registry.
#[derive(Error, Debug)]
pub enum Error {
    /// Another process holds the exclusive database lock.
    #[error("database lock is held by another process")]
    LockHeld,

    /// The backing file exceeds the size limit.
    #[error("database is {len} bytes, over the {max} byte limit")]
    TooLarge { len: u64, max: u64 },

    /// Disk or file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The udev devpath failed validation.
    #[error("invalid devpath: {0}")]
    BadDevpath(String),

    /// The devpath did not map to a valid policy rule.
    #[error("devpath produced an invalid policy rule: {0:?}")]
    BadRule(String),

    /// An operation needing the per-user database ran without one.
    #[error("no user database is available")]
    NoUserDb,
}
