//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, driven by manager.rs
//! what: NodeState enum, ConsensusState snapshot, RaftNode with election and replication bookkeeping
//!
//! nothing in here performs io beyond the log collaborator: callers feed in
//! messages and get back responses plus a hint about whether the election
//! timer should be reset. timers and transports live in manager.rs.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::{HardState, LogEntry, RaftLog};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::NodeId;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time copy of a node's consensus view.
///
/// Handed out by value; mutating it never touches the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub role: NodeState,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// A single Raft node in the cluster
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every other member of the cluster
    pub peers: Vec<NodeId>,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number, never decreases
    pub current_term: u64,
    /// Node that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Highest index known to be replicated on a majority
    pub commit_index: u64,
    /// Highest index handed to the consumer via `take_committed`
    pub last_applied: u64,
    /// Most recently observed leader
    pub leader_id: Option<NodeId>,
    /// Votes tallied in the current election, self included
    pub votes_received: Vec<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, u64>,
    log: Box<dyn RaftLog>,
}

impl fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("commit_index", &self.commit_index)
            .field("last_log_index", &self.last_log_index())
            .finish()
    }
}

impl RaftNode {
    /// Create a node in Follower state, restoring term and vote from the log
    pub fn new(id: impl Into<NodeId>, peers: Vec<NodeId>, log: Box<dyn RaftLog>) -> Result<Self> {
        let hard_state = log.hard_state()?;
        Ok(Self::from_parts(id, peers, log, hard_state))
    }

    /// Assemble a node from an already-loaded hard state
    pub fn from_parts(
        id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        log: Box<dyn RaftLog>,
        hard_state: HardState,
    ) -> Self {
        let id = id.into();
        let HardState {
            current_term,
            voted_for,
        } = hard_state;
        let peers = peers.into_iter().filter(|p| *p != id).collect();

        Self {
            id,
            peers,
            state: NodeState::Follower,
            current_term,
            voted_for,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            log,
        }
    }

    /// Give the log back, e.g. when the manager shuts down
    pub fn into_log(self) -> Box<dyn RaftLog> {
        self.log
    }

    pub fn log(&self) -> &dyn RaftLog {
        self.log.as_ref()
    }

    pub fn snapshot(&self) -> ConsensusState {
        ConsensusState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            role: self.state,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
        }
    }

    // -- quorum arithmetic --

    /// floor(cluster / 2) + 1 where cluster = peers + self
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.entry(index)
    }

    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index)
    }

    fn persist(&mut self) -> Result<()> {
        let hard_state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.log.save_hard_state(&hard_state)?;
        Ok(())
    }

    // -- role transitions --

    /// Step down to follower. A higher term is adopted and clears the vote;
    /// the same term keeps whatever vote was already cast in it.
    pub fn become_follower(&mut self, term: u64) -> Result<()> {
        let previous = self.state;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.leader_id = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.persist()?;

        if previous != NodeState::Follower {
            tracing::info!(node_id = %self.id, term = self.current_term, from = %previous, "Became follower");
        }
        Ok(())
    }

    /// Adopt a term seen on any message. Returns true if it was higher.
    pub fn observe_term(&mut self, term: u64) -> Result<bool> {
        if term > self.current_term {
            tracing::debug!(
                node_id = %self.id,
                term,
                current_term = self.current_term,
                "Observed higher term"
            );
            self.become_follower(term)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Bump the term, vote for self and build the request to fan out
    pub fn start_election(&mut self) -> Result<VoteRequest> {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.votes_received = vec![self.id.clone()];
        self.leader_id = None;
        self.persist()?;

        tracing::info!(node_id = %self.id, term = self.current_term, "Starting election");

        Ok(VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        })
    }

    /// Tally one vote response. Returns true if this vote made us leader.
    pub fn handle_vote_response(&mut self, from: &str, response: &VoteResponse) -> Result<bool> {
        if self.observe_term(response.term)? {
            return Ok(false);
        }
        if self.state != NodeState::Candidate || response.term < self.current_term {
            return Ok(false);
        }
        if response.vote_granted && !self.votes_received.iter().any(|v| v == from) {
            self.votes_received.push(from.to_string());
            tracing::debug!(
                node_id = %self.id,
                peer = from,
                votes = self.votes_received.len(),
                "Received vote"
            );
        }
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id.clone());
        let votes = self.votes_received.len();
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        self.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();

        tracing::info!(node_id = %self.id, term = self.current_term, votes, "Became leader");
    }

    /// Voluntarily give up leadership. Returns false for non-leaders.
    pub fn step_down(&mut self) -> Result<bool> {
        if self.state != NodeState::Leader {
            return Ok(false);
        }
        self.become_follower(self.current_term)?;
        Ok(true)
    }

    // -- vote handling --

    /// Candidate's (last_log_term, last_log_index) is not behind ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_term = self.last_log_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_log_index())
    }

    /// Answer a RequestVote. The flag is true when the election timer should reset.
    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> Result<(VoteResponse, bool)> {
        self.observe_term(request.term)?;

        let vote_granted = request.term >= self.current_term
            && self
                .voted_for
                .as_ref()
                .map_or(true, |v| *v == request.candidate_id)
            && self.is_log_up_to_date(request.last_log_index, request.last_log_term);

        if vote_granted {
            self.voted_for = Some(request.candidate_id.clone());
            self.persist()?;
        }

        tracing::debug!(
            node_id = %self.id,
            candidate = %request.candidate_id,
            term = request.term,
            granted = vote_granted,
            "RequestVote response"
        );

        Ok((
            VoteResponse {
                term: self.current_term,
                vote_granted,
            },
            vote_granted,
        ))
    }

    // -- replication (leader side) --

    /// Append a command at the end of the leader's log
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        let index = self.last_log_index() + 1;
        let entry = LogEntry::new(self.current_term, index, command);
        self.log.append(entry.clone())?;
        tracing::debug!(node_id = %self.id, index, term = entry.term, "Appended command to log");
        Ok(entry)
    }

    /// Build the AppendEntries for one peer starting at its next_index.
    /// Carries no entries when the peer is caught up.
    pub fn append_entries_for(&self, peer: &str) -> Option<AppendEntriesRequest> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .max(1);
        let prev_log_index = next - 1;

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    /// Apply a peer's answer to a request we sent. Returns true if the
    /// commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        peer: &str,
        response: &AppendEntriesResponse,
        sent: &AppendEntriesRequest,
    ) -> Result<bool> {
        if self.observe_term(response.term)? {
            return Ok(false);
        }
        if self.state != NodeState::Leader || sent.term != self.current_term {
            return Ok(false);
        }

        if response.success {
            let matched = sent.last_index();
            let current = self.match_index.get(peer).copied().unwrap_or(0);
            if matched > current {
                self.match_index.insert(peer.to_string(), matched);
            }
            let next = self.match_index.get(peer).copied().unwrap_or(matched) + 1;
            self.next_index.insert(peer.to_string(), next);
            return Ok(self.advance_commit_index());
        }

        // back up one entry behind what we tried and retry on the next round
        let retry_from = sent.prev_log_index.max(1);
        let current = self.next_index.get(peer).copied().unwrap_or(retry_from);
        self.next_index.insert(peer.to_string(), current.min(retry_from));
        tracing::debug!(node_id = %self.id, peer, next_index = retry_from, "Peer log mismatch, backing up");
        Ok(false)
    }

    /// Commit the highest current-term index held by a majority (leader included)
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let quorum = self.quorum_size();
        let mut candidate = self.last_log_index();
        while candidate > self.commit_index {
            // entries from earlier terms only commit indirectly
            if self.get_term_at(candidate) == self.current_term {
                let replicas = 1 + self.match_index.values().filter(|m| **m >= candidate).count();
                if replicas >= quorum {
                    tracing::debug!(node_id = %self.id, commit_index = candidate, "Updated commit index");
                    self.commit_index = candidate;
                    return true;
                }
            }
            candidate -= 1;
        }
        false
    }

    // -- replication (follower side) --

    /// Answer an AppendEntries. The flag is true when the election timer should reset.
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        self.observe_term(request.term)?;

        if request.term < self.current_term {
            return Ok((self.append_response(false), false));
        }

        // valid leader for our term: candidates concede
        if self.state != NodeState::Follower {
            self.become_follower(request.term)?;
        }
        self.leader_id = Some(request.leader_id.clone());

        let prev_matches = request.prev_log_index == 0
            || self
                .get_entry(request.prev_log_index)
                .is_some_and(|e| e.term == request.prev_log_term);
        if !prev_matches {
            tracing::debug!(
                node_id = %self.id,
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                "Log mismatch, rejecting AppendEntries"
            );
            return Ok((self.append_response(false), true));
        }

        for entry in &request.entries {
            match self.get_entry(entry.index).map(|e| e.term) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        tracing::error!(
                            node_id = %self.id,
                            index = entry.index,
                            commit_index = self.commit_index,
                            "Refusing to overwrite committed entry"
                        );
                        return Ok((self.append_response(false), true));
                    }
                    self.log.truncate_after(entry.index - 1)?;
                    self.log.append(entry.clone())?;
                }
                None => {
                    self.log.append(entry.clone())?;
                }
            }
        }

        if !request.entries.is_empty() {
            tracing::debug!(
                node_id = %self.id,
                entries = request.entries.len(),
                last_index = self.last_log_index(),
                "Appended entries"
            );
        }

        if request.leader_commit > self.commit_index {
            let vouched = request.last_index().min(self.last_log_index());
            self.commit_index = self.commit_index.max(request.leader_commit.min(vouched));
        }

        Ok((self.append_response(true), true))
    }

    fn append_response(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
        }
    }

    // -- state machine application --

    /// Committed entries not yet handed out; advances last_applied
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            match self.log.entry(self.last_applied + 1) {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
            self.last_applied += 1;
        }
        entries
    }
}
