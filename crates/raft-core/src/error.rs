//! # error
//!
//! why: give callers one error type for everything the consensus core can refuse
//! relations: returned by manager.rs and node.rs, wraps io errors from log.rs
//! what: ConsensusError, Result alias

use thiserror::Error;

/// Errors surfaced synchronously to callers of the consensus manager.
///
/// Transport failures are not part of this enum: the drivers absorb them as
/// lost votes or lost acknowledgements (see `transport::RpcError`).
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Operation issued before `initialize` or after `shutdown`.
    #[error("consensus manager is not initialized")]
    NotInitialized,

    /// `initialize` called on a manager that is already running.
    #[error("consensus manager is already initialized")]
    AlreadyInitialized,

    /// The supplied configuration cannot drive a cluster.
    #[error("invalid raft configuration: {0}")]
    InvalidConfig(String),

    /// The durable log failed to persist a write.
    #[error("log storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A proposal or message could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
