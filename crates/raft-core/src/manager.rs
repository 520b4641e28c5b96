//! # manager
//!
//! why: drive the sans-io node with real timers and a transport
//! relations: owns node.rs behind a mutex, arms timer.rs collaborators, fans out through transport.rs
//! what: ConsensusManager (public contract), election driver, replication driver, rpc entry points
//!
//! every state mutation happens under one async mutex. the lock is released
//! while rpcs are in flight; results are applied afterwards and only count if
//! the node is still in the term and role that sent them.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::config::RaftConfig;
use crate::error::{ConsensusError, Result};
use crate::log::{LogEntry, Proposal, RaftLog};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::node::{ConsensusState, NodeState, RaftNode};
use crate::timer::{
    BoxFuture, Callback, ElectionTimer, HeartbeatScheduler, IntervalHeartbeat, RandomizedElectionTimer,
};
use crate::transport::RaftTransport;
use crate::NodeId;

type AppendOutcome = (NodeId, AppendEntriesRequest, AppendEntriesResponse);

/// Node slot: the log sits idle until `initialize` hands it to a RaftNode
struct Core {
    idle_log: Option<Box<dyn RaftLog>>,
    node: Option<RaftNode>,
}

impl Core {
    fn running(&mut self) -> Result<&mut RaftNode> {
        self.node.as_mut().ok_or(ConsensusError::NotInitialized)
    }
}

struct Shared {
    config: RaftConfig,
    core: Mutex<Core>,
    election_timer: Arc<dyn ElectionTimer>,
    heartbeat: Arc<dyn HeartbeatScheduler>,
    transport: Arc<dyn RaftTransport>,
}

/// Client-facing handle to one consensus node. Cloning is cheap.
#[derive(Clone)]
pub struct ConsensusManager {
    shared: Arc<Shared>,
}

/// Non-owning handle, for transports that route back into managers
#[derive(Clone)]
pub struct WeakConsensusManager {
    shared: Weak<Shared>,
}

impl WeakConsensusManager {
    pub fn upgrade(&self) -> Option<ConsensusManager> {
        self.shared.upgrade().map(|shared| ConsensusManager { shared })
    }
}

impl ConsensusManager {
    pub fn new(
        config: RaftConfig,
        log: Box<dyn RaftLog>,
        election_timer: Arc<dyn ElectionTimer>,
        heartbeat: Arc<dyn HeartbeatScheduler>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                core: Mutex::new(Core {
                    idle_log: Some(log),
                    node: None,
                }),
                election_timer,
                heartbeat,
                transport,
            }),
        })
    }

    /// Manager with tokio-backed timers sized from `config`
    pub fn with_tokio_timers(
        config: RaftConfig,
        log: Box<dyn RaftLog>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Self> {
        let election_timer = Arc::new(RandomizedElectionTimer::from_config(&config));
        Self::new(
            config,
            log,
            election_timer,
            Arc::new(IntervalHeartbeat::new()),
            transport,
        )
    }

    pub fn downgrade(&self) -> WeakConsensusManager {
        WeakConsensusManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &RaftConfig {
        &self.shared.config
    }

    /// Record identity and peers, hook up the collaborators and arm the election timer
    pub async fn initialize(&self, node_id: impl Into<NodeId>, peers: Vec<NodeId>) -> Result<()> {
        let node_id = node_id.into();
        let mut core = self.shared.core.lock().await;
        if core.node.is_some() {
            return Err(ConsensusError::AlreadyInitialized);
        }
        // only a running node ever holds the log
        let log = core.idle_log.take().ok_or(ConsensusError::NotInitialized)?;
        let hard_state = match log.hard_state() {
            Ok(hard_state) => hard_state,
            Err(e) => {
                core.idle_log = Some(log);
                return Err(e.into());
            }
        };

        let node = RaftNode::from_parts(node_id, peers, log, hard_state);
        tracing::info!(
            node_id = %node.id,
            peers = node.peers.len(),
            term = node.current_term,
            "Initialized consensus node"
        );
        core.node = Some(node);

        self.shared.election_timer.on_timeout(self.callback(|shared| -> BoxFuture<()> {
            Box::pin(async move {
                if let Err(e) = shared.run_election().await {
                    tracing::warn!(error = %e, "Election round failed");
                }
            })
        }));
        self.shared.heartbeat.on_tick(self.callback(|shared| -> BoxFuture<()> {
            Box::pin(async move {
                if let Err(e) = shared.replicate().await {
                    tracing::warn!(error = %e, "Heartbeat round failed");
                }
            })
        }));
        self.shared.election_timer.start();
        Ok(())
    }

    fn callback<F>(&self, run: F) -> Callback
    where
        F: Fn(Arc<Shared>) -> BoxFuture<()> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        Arc::new(move || match weak.upgrade() {
            Some(shared) => run(shared),
            None => Box::pin(async {}) as BoxFuture<()>,
        })
    }

    /// Append and replicate a proposal. Returns false when not leader or when
    /// a majority did not acknowledge; the caller should retry or resubmit.
    pub async fn propose(&self, proposal: &Proposal) -> Result<bool> {
        self.shared.propose(proposal).await
    }

    /// Run one election round now, as if the election timer had fired
    pub async fn trigger_election(&self) -> Result<()> {
        self.shared.run_election().await
    }

    /// Run one replication round now, as if the heartbeat had ticked
    pub async fn replicate(&self) -> Result<()> {
        self.shared.replicate().await
    }

    pub async fn handle_vote_request(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.shared.handle_vote_request(request).await
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.shared.handle_append_entries(request).await
    }

    pub async fn get_state(&self) -> Result<ConsensusState> {
        let mut core = self.shared.core.lock().await;
        Ok(core.running()?.snapshot())
    }

    pub async fn get_leader(&self) -> Result<Option<NodeId>> {
        let mut core = self.shared.core.lock().await;
        Ok(core.running()?.leader_id.clone())
    }

    /// True iff this node leads and `node_id` is its own identity
    pub async fn is_leader(&self, node_id: &str) -> Result<bool> {
        let mut core = self.shared.core.lock().await;
        let node = core.running()?;
        Ok(node.state == NodeState::Leader && node.id == node_id)
    }

    pub async fn node_id(&self) -> Result<NodeId> {
        let mut core = self.shared.core.lock().await;
        Ok(core.running()?.id.clone())
    }

    pub async fn last_log_index(&self) -> Result<u64> {
        let mut core = self.shared.core.lock().await;
        Ok(core.running()?.last_log_index())
    }

    /// Committed entries the consumer has not seen yet; advances last_applied
    pub async fn committed_entries(&self) -> Result<Vec<LogEntry>> {
        let mut core = self.shared.core.lock().await;
        Ok(core.running()?.take_committed())
    }

    /// Give up leadership. No-op for non-leaders.
    pub async fn step_down(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        let node = core.running()?;
        if node.step_down()? {
            tracing::info!(node_id = %node.id, term = node.current_term, "Stepped down");
            self.shared.sync_timers(NodeState::Leader, node.state);
        }
        Ok(())
    }

    /// Stop both timers and return to the uninitialized state. Idempotent.
    pub async fn shutdown(&self) {
        // timers are only re-armed under the core lock, so stop them while holding it
        let mut core = self.shared.core.lock().await;
        self.shared.election_timer.stop();
        self.shared.heartbeat.stop();

        if let Some(node) = core.node.take() {
            tracing::info!(node_id = %node.id, term = node.current_term, "Shut down consensus node");
            core.idle_log = Some(node.into_log());
        }
    }
}

impl Shared {
    /// Arm or disarm collaborators after a role change
    fn sync_timers(&self, before: NodeState, after: NodeState) {
        match (before, after) {
            (b, NodeState::Leader) if b != NodeState::Leader => {
                self.election_timer.stop();
                self.heartbeat.start(self.config.heartbeat_duration());
            }
            (NodeState::Leader, a) if a != NodeState::Leader => {
                self.heartbeat.stop();
                self.election_timer.reset();
            }
            (NodeState::Candidate, NodeState::Follower) => {
                self.election_timer.reset();
            }
            _ => {}
        }
    }

    // -- election driver --

    async fn run_election(&self) -> Result<()> {
        let (request, peers) = {
            let mut core = self.core.lock().await;
            let node = core.running()?;
            if node.state == NodeState::Leader {
                return Ok(());
            }
            let before = node.state;
            let request = node.start_election()?;

            if node.has_quorum() {
                // lone node: the self-vote is already a majority
                node.become_leader();
                self.sync_timers(before, node.state);
                return Ok(());
            }
            // a round that goes nowhere retries on the next randomized timeout
            self.election_timer.reset();
            (request, node.peers.clone())
        };

        let term = request.term;
        let responses = self.fan_out_votes(&peers, request).await;

        let mut core = self.core.lock().await;
        let node = core.running()?;
        let before = node.state;

        // a higher term anywhere beats any local majority
        if let Some(highest) = responses.iter().map(|(_, r)| r.term).max() {
            if node.observe_term(highest)? {
                self.sync_timers(before, node.state);
                return Ok(());
            }
        }
        if node.state != NodeState::Candidate || node.current_term != term {
            tracing::debug!(node_id = %node.id, term, "Election superseded");
            return Ok(());
        }

        for (peer, response) in &responses {
            if node.handle_vote_response(peer, response)? {
                break;
            }
        }

        if node.state != NodeState::Leader {
            tracing::info!(
                node_id = %node.id,
                term,
                votes = node.votes_received.len(),
                needed = node.quorum_size(),
                "Election failed, not enough votes"
            );
            // keeps the self-vote: this term's ballot is already cast
            node.become_follower(term)?;
        }
        self.sync_timers(before, node.state);
        Ok(())
    }

    async fn fan_out_votes(&self, peers: &[NodeId], request: VoteRequest) -> Vec<(NodeId, VoteResponse)> {
        let limit = self.config.rpc_timeout_duration();
        let mut calls = JoinSet::new();
        for peer in peers {
            let transport = self.transport.clone();
            let request = request.clone();
            let peer = peer.clone();
            calls.spawn(async move {
                let outcome = tokio::time::timeout(limit, transport.request_vote(&peer, request)).await;
                (peer, outcome)
            });
        }

        let mut responses = Vec::with_capacity(peers.len());
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((peer, Ok(Ok(response)))) => responses.push((peer, response)),
                Ok((peer, Ok(Err(e)))) => {
                    tracing::debug!(peer = %peer, error = %e, "Vote request failed");
                }
                Ok((peer, Err(_))) => tracing::debug!(peer = %peer, "Vote request timed out"),
                Err(e) => tracing::warn!(error = %e, "Vote request task aborted"),
            }
        }
        responses
    }

    // -- replication driver --

    async fn propose(&self, proposal: &Proposal) -> Result<bool> {
        let command = proposal.to_command()?;
        let (entry, requests) = {
            let mut core = self.core.lock().await;
            let node = core.running()?;
            if node.state != NodeState::Leader {
                tracing::debug!(node_id = %node.id, role = %node.state, "Rejecting proposal, not leader");
                return Ok(false);
            }
            let entry = node.append_entry(command)?;
            node.advance_commit_index();
            (entry, Self::build_appends(node))
        };

        let outcomes = self.fan_out_appends(requests).await;

        let mut core = self.core.lock().await;
        let node = core.running()?;
        self.apply_append_outcomes(node, &outcomes)?;

        let committed = node.commit_index >= entry.index && node.get_term_at(entry.index) == entry.term;
        tracing::debug!(
            node_id = %node.id,
            index = entry.index,
            kind = %proposal.kind,
            committed,
            "Proposal replicated"
        );
        Ok(committed)
    }

    /// One heartbeat round: replicate to every peer from its next_index
    async fn replicate(&self) -> Result<()> {
        let requests = {
            let mut core = self.core.lock().await;
            let node = core.running()?;
            if node.state != NodeState::Leader {
                return Ok(());
            }
            Self::build_appends(node)
        };
        tracing::trace!(peers = requests.len(), "Sending heartbeats");

        let outcomes = self.fan_out_appends(requests).await;

        let mut core = self.core.lock().await;
        let node = core.running()?;
        self.apply_append_outcomes(node, &outcomes)
    }

    fn build_appends(node: &RaftNode) -> Vec<(NodeId, AppendEntriesRequest)> {
        node.peers
            .iter()
            .filter_map(|peer| node.append_entries_for(peer).map(|req| (peer.clone(), req)))
            .collect()
    }

    fn apply_append_outcomes(&self, node: &mut RaftNode, outcomes: &[AppendOutcome]) -> Result<()> {
        let before = node.state;
        if let Some(highest) = outcomes.iter().map(|(_, _, r)| r.term).max() {
            if node.observe_term(highest)? {
                self.sync_timers(before, node.state);
                return Ok(());
            }
        }
        for (peer, sent, response) in outcomes {
            node.handle_append_entries_response(peer, response, sent)?;
        }
        Ok(())
    }

    async fn fan_out_appends(&self, requests: Vec<(NodeId, AppendEntriesRequest)>) -> Vec<AppendOutcome> {
        let limit = self.config.rpc_timeout_duration();
        let expected = requests.len();
        let mut calls = JoinSet::new();
        for (peer, request) in requests {
            let transport = self.transport.clone();
            calls.spawn(async move {
                let outcome =
                    tokio::time::timeout(limit, transport.append_entries(&peer, request.clone())).await;
                (peer, request, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(expected);
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((peer, sent, Ok(Ok(response)))) => outcomes.push((peer, sent, response)),
                Ok((peer, _, Ok(Err(e)))) => {
                    tracing::debug!(peer = %peer, error = %e, "AppendEntries failed");
                }
                Ok((peer, _, Err(_))) => tracing::debug!(peer = %peer, "AppendEntries timed out"),
                Err(e) => tracing::warn!(error = %e, "AppendEntries task aborted"),
            }
        }
        outcomes
    }

    // -- rpc handlers --

    async fn handle_vote_request(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut core = self.core.lock().await;
        let node = core.running()?;
        let before = node.state;
        let (response, reset_timer) = node.handle_vote_request(&request)?;
        self.sync_timers(before, node.state);
        if reset_timer {
            self.election_timer.reset();
        }
        Ok(response)
    }

    async fn handle_append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let mut core = self.core.lock().await;
        let node = core.running()?;
        let before = node.state;
        let (response, reset_timer) = node.handle_append_entries(&request)?;
        self.sync_timers(before, node.state);
        if reset_timer {
            self.election_timer.reset();
        }
        Ok(response)
    }
}
