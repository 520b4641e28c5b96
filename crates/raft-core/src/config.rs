//! # config
//!
//! why: keep election and heartbeat timing in one validated place
//! relations: read by manager.rs when arming collaborators, by timer.rs for jitter bounds
//! what: RaftConfig with defaults, validation and json loading

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};

/// Timing configuration for a consensus node (all values in milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Cadence at which a leader replicates to its peers
    pub heartbeat_interval: u64,
    /// How long a single vote/append rpc may take before it counts as lost
    pub rpc_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            heartbeat_interval: 1000,
            rpc_timeout: 500,
        }
    }
}

impl RaftConfig {
    /// Parse a config from json; missing fields fall back to defaults
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject timings that would make elections fire before heartbeats land
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 {
            return Err(ConsensusError::InvalidConfig(
                "election_timeout_min must be positive".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConsensusError::InvalidConfig(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConsensusError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be positive and below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        // a vote round must finish before the next election timeout re-arms
        if self.rpc_timeout == 0 || self.rpc_timeout >= self.election_timeout_min {
            return Err(ConsensusError::InvalidConfig(format!(
                "rpc_timeout ({}) must be positive and below election_timeout_min ({})",
                self.rpc_timeout, self.election_timeout_min
            )));
        }
        Ok(())
    }

    pub fn heartbeat_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
