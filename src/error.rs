//! Crate error type.
//!
//! The error taxonomy is deliberately coarse: synchronous tree training has
//! no meaningful partial-success state, so anything that goes wrong past
//! configuration validation ends the run. Invariant violations (malformed
//! planner output, unexpected mailbox senders, element-count mismatches)
//! are programmer errors and panic instead of returning `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at coordinator entry (empty device list, duplicates, ids
    /// outside the runtime's device range).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Accelerator runtime failure (allocation, copy, device set, peer
    /// access). The device fleet is assumed stable for the lifetime of a
    /// run, so these are not retried.
    #[error("accelerator runtime error: {0}")]
    Runtime(String),

    /// Training driver failure surfaced through a replica.
    #[error("driver error: {0}")]
    Driver(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
