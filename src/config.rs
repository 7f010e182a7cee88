//! Cache configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty file (or no file)
//! yields a working synchronous distributed cache.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::partition::PartitionHandling;

/// How writes are distributed and whether the caller waits for remote acknowledgements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// No clustering; nothing is ever sent to other nodes.
    Local,
    /// Every member owns every segment; writes go to all members and wait for them.
    ReplSync,
    /// Every member owns every segment; writes are fire-and-forget.
    ReplAsync,
    /// Each segment has `num_owners` owners; writes go to the owners and wait for them.
    #[default]
    DistSync,
    /// Each segment has `num_owners` owners; writes are fire-and-forget.
    DistAsync,
}

impl CacheMode {
    pub fn is_clustered(self) -> bool {
        !matches!(self, CacheMode::Local)
    }

    pub fn is_replicated(self) -> bool {
        matches!(self, CacheMode::ReplSync | CacheMode::ReplAsync)
    }

    pub fn is_distributed(self) -> bool {
        matches!(self, CacheMode::DistSync | CacheMode::DistAsync)
    }

    pub fn is_synchronous(self) -> bool {
        matches!(self, CacheMode::Local | CacheMode::ReplSync | CacheMode::DistSync)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache name, used in logs.
    pub name: String,
    pub mode: CacheMode,
    /// Owners per segment in distributed modes (primary included).
    pub num_owners: usize,
    /// Number of hash segments the key space is split into.
    pub num_segments: u32,
    /// Prepare with `one_phase = true` and skip the commit round.
    pub one_phase_commit: bool,
    /// Wait for rollback acknowledgements (leavers ignored).
    pub sync_rollback_phase: bool,
    /// Retries granted to the commit step on peer loss or in-flight state transfer.
    pub commit_retries: u32,
    /// Upper bound on any wait for a topology change.
    #[serde(with = "humantime_serde")]
    pub topology_wait_timeout: Duration,
    /// Upper bound on a synchronous remote invocation, per target.
    #[serde(with = "humantime_serde")]
    pub remote_timeout: Duration,
    pub partition_handling: PartitionHandling,
    /// Whether view changes trigger a rebalance (and state transfer).
    pub rebalancing_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            mode: CacheMode::DistSync,
            num_owners: 2,
            num_segments: 256,
            one_phase_commit: false,
            sync_rollback_phase: true,
            commit_retries: 3,
            topology_wait_timeout: Duration::from_secs(10),
            remote_timeout: Duration::from_secs(5),
            partition_handling: PartitionHandling::AllowReadWrites,
            rebalancing_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading cache config {}", path.display()))?;
        let config: CacheConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing cache config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.num_segments == 0 {
            return Err(CacheError::Configuration(
                "num_segments must be greater than zero".to_string(),
            ));
        }
        if self.mode.is_distributed() && self.num_owners == 0 {
            return Err(CacheError::Configuration(
                "num_owners must be greater than zero".to_string(),
            ));
        }
        if self.topology_wait_timeout.is_zero() || self.remote_timeout.is_zero() {
            return Err(CacheError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
