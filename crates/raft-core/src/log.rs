//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, implemented durably by raft-storage
//! what: LogEntry, Proposal, HardState, the RaftLog trait and MemoryLog

use std::io;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed, contiguous)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// Decode the command as a proposal submitted through `propose`
    pub fn proposal(&self) -> serde_json::Result<Proposal> {
        serde_json::from_slice(&self.command)
    }
}

/// A unit of work a client asks the leader to commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Application-level type tag, e.g. "task.assign"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub proposer_id: NodeId,
}

impl Proposal {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, proposer_id: impl Into<NodeId>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            proposer_id: proposer_id.into(),
        }
    }

    /// Serialized form stored as `LogEntry::command`
    pub fn to_command(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Raft state that must survive a restart alongside the log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Durable log collaborator.
///
/// Writes must be durable before they return. Lookups of unknown indices
/// return `None` rather than failing.
pub trait RaftLog: Send {
    /// Append an entry whose index is `last_index() + 1`, returning that index
    fn append(&mut self, entry: LogEntry) -> io::Result<u64>;

    /// Entry at a 1-based index
    fn entry(&self, index: u64) -> Option<&LogEntry>;

    /// Index of the last entry, 0 for an empty log
    fn last_index(&self) -> u64;

    /// Term of the last entry, 0 for an empty log
    fn last_term(&self) -> u64;

    /// Drop every entry with an index greater than `index`
    fn truncate_after(&mut self, index: u64) -> io::Result<()>;

    /// Persist the current term and vote
    fn save_hard_state(&mut self, state: &HardState) -> io::Result<()>;

    /// Load the persisted term and vote (defaults for a fresh log)
    fn hard_state(&self) -> io::Result<HardState>;

    /// Term of the entry at `index`, 0 when absent (index 0 is the empty prefix)
    fn term_at(&self, index: u64) -> u64 {
        self.entry(index).map(|e| e.term).unwrap_or(0)
    }

    /// Clone every entry from `start` (inclusive) to the end of the log
    fn entries_from(&self, start: u64) -> Vec<LogEntry> {
        let start = start.max(1);
        (start..=self.last_index())
            .filter_map(|index| self.entry(index).cloned())
            .collect()
    }
}

// -- in-memory log implementation --

/// in-memory log for tests and ephemeral nodes
///
/// nothing survives the process, but it honours the same contract as the
/// durable implementation in raft-storage
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
    hard_state: HardState,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a log with existing entries (indices must be contiguous from 1)
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries,
            hard_state: HardState::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RaftLog for MemoryLog {
    fn append(&mut self, mut entry: LogEntry) -> io::Result<u64> {
        let index = self.last_index() + 1;
        entry.index = index;
        self.entries.push(entry);
        Ok(index)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        self.entries.retain(|e| e.index <= index);
        Ok(())
    }

    fn save_hard_state(&mut self, state: &HardState) -> io::Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn hard_state(&self) -> io::Result<HardState> {
        Ok(self.hard_state.clone())
    }
}
