//! # transport
//!
//! why: the core only needs "send this rpc to that peer", not a network stack
//! relations: called by manager.rs during elections and replication, LocalNetwork routes back into manager.rs
//! what: RaftTransport trait, RpcError, LocalNetwork in-process transport with partitions

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::manager::{ConsensusManager, WeakConsensusManager};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse};
use crate::NodeId;

/// Why an rpc produced no response. Drivers count these as lost messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("malformed message: {0}")]
    Codec(String),

    #[error("peer failed to handle request: {0}")]
    Remote(String),
}

/// RPC client used by a node to reach its peers.
///
/// May be called concurrently for distinct peers.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &str, request: VoteRequest) -> Result<VoteResponse, RpcError>;

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError>;
}

// -- in-process network --

#[derive(Default)]
struct Routes {
    nodes: HashMap<NodeId, WeakConsensusManager>,
    isolated: HashSet<NodeId>,
}

/// Routes rpcs between managers living in the same process.
///
/// Every message is encoded and decoded on the way through, so anything that
/// would not survive a real wire fails here too. Managers are held weakly.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<RwLock<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<NodeId>, manager: &ConsensusManager) {
        self.write().nodes.insert(id.into(), manager.downgrade());
    }

    /// Cut a node off from everyone else until `heal`
    pub fn isolate(&self, id: &str) {
        tracing::debug!(node_id = id, "Isolating node");
        self.write().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        tracing::debug!(node_id = id, "Healing node");
        self.write().isolated.remove(id);
    }

    pub fn heal_all(&self) {
        self.write().isolated.clear();
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(|p| p.into_inner())
    }

    fn route(&self, from: &str, to: &str) -> Result<ConsensusManager, RpcError> {
        let routes = self.routes.read().unwrap_or_else(|p| p.into_inner());
        if routes.isolated.contains(from) || routes.isolated.contains(to) {
            return Err(RpcError::Unreachable(to.to_string()));
        }
        routes
            .nodes
            .get(to)
            .and_then(WeakConsensusManager::upgrade)
            .ok_or_else(|| RpcError::Unreachable(to.to_string()))
    }
}

fn over_the_wire(message: RaftMessage) -> Result<RaftMessage, RpcError> {
    let bytes = message.encode().map_err(|e| RpcError::Codec(e.to_string()))?;
    RaftMessage::decode(&bytes).map_err(|e| RpcError::Codec(e.to_string()))
}

fn unexpected(message: &RaftMessage) -> RpcError {
    RpcError::Codec(format!("unexpected message with term {}", message.term()))
}

#[async_trait]
impl RaftTransport for LocalNetwork {
    async fn request_vote(&self, peer: &str, request: VoteRequest) -> Result<VoteResponse, RpcError> {
        let from = request.candidate_id.clone();
        let target = self.route(&from, peer)?;
        let request = match over_the_wire(request.into())? {
            RaftMessage::VoteRequest(r) => r,
            other => return Err(unexpected(&other)),
        };

        let response = target
            .handle_vote_request(request)
            .await
            .map_err(|e| RpcError::Remote(e.to_string()))?;

        // the partition may have formed while the peer was answering
        self.route(peer, &from)?;
        match over_the_wire(response.into())? {
            RaftMessage::VoteResponse(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        let from = request.leader_id.clone();
        let target = self.route(&from, peer)?;
        let request = match over_the_wire(request.into())? {
            RaftMessage::AppendEntries(r) => r,
            other => return Err(unexpected(&other)),
        };

        let response = target
            .handle_append_entries(request)
            .await
            .map_err(|e| RpcError::Remote(e.to_string()))?;

        self.route(peer, &from)?;
        match over_the_wire(response.into())? {
            RaftMessage::AppendEntriesResponse(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }
}
