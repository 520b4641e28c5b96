//! # raft-core
//!
//! why: elect a coordinating node and replicate an ordered command log across cooperating agents
//! relations: raft-storage implements the durable log; schedulers call ConsensusManager::propose
//! what: sans-io state machine, async consensus manager, message types, timers, transport seam

pub mod config;
pub mod error;
pub mod log;
pub mod manager;
pub mod message;
pub mod node;
pub mod timer;
pub mod transport;

/// Opaque identity of a cluster member, fixed for the process lifetime
pub type NodeId = String;

pub use config::RaftConfig;
pub use error::{ConsensusError, Result};
pub use log::{HardState, LogEntry, MemoryLog, Proposal, RaftLog};
pub use manager::{ConsensusManager, WeakConsensusManager};
pub use message::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse};
pub use node::{ConsensusState, NodeState, RaftNode};
pub use timer::{Callback, ElectionTimer, HeartbeatScheduler, IntervalHeartbeat, RandomizedElectionTimer};
pub use transport::{LocalNetwork, RaftTransport, RpcError};
