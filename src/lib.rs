//! vm-relay — host-side control plane for lightweight VMs and their
//! containers.
//!
//! The daemon owns a registry of running VMs, routes RPCs from the two
//! in-guest agents to per-VM state on a single control thread, mints opaque
//! per-container security tokens, rate-limits UI-disturbing operations, and
//! re-publishes container lifecycle events to upstream subscribers.

pub mod error;
pub mod ipc;
pub mod listener;
pub mod pools;
pub mod rate_limit;
pub mod registry;
pub mod service;
pub mod token;
pub mod tremplin;
pub mod upstream;
pub mod vmm;
pub mod vsock;

pub use error::{Error, Result};
