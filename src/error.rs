//! Error types for vm-relay.

use thiserror::Error;

/// Result type alias using the vm-relay Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in control-service operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation failure on request arguments. Reported to the caller,
    /// never logged at error level.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Referenced VM, container, or token is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A VM with the same (owner, name) already exists.
    #[error("duplicate VM: {0}")]
    Duplicate(String),

    /// The presented container token matches no pending or registered
    /// container.
    #[error("unknown container token")]
    UnknownToken,

    /// Transport, upstream IPC, or remote agent unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Disk or file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Open-URL / open-terminal quota exceeded.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A resource pool has no free entries left.
    #[error("resource pool exhausted: {0}")]
    PoolExhausted(String),

    /// Wire-format errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] vm_relay_protocol::ProtocolError),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// System call errors.
    #[error("system error: {0}")]
    System(#[from] nix::Error),

    /// Invariant violated; the process terminates after best-effort cleanup.
    #[error("fatal: {0}")]
    Fatal(String),
}
