//! Error taxonomy for cache operations.
//!
//! Only `PeerSuspected` and `StateTransferInProgress` are retried, and only by the commit
//! path of the replication coordinator. Every other kind reaches the caller unchanged.

use std::time::Duration;

use thiserror::Error;

use crate::commands::GlobalTransactionId;
use crate::membership::types::Address;
use crate::partition::Reachability;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    /// A target left the cluster view while the command was in flight.
    #[error("peer {address} is suspected to have left the cluster")]
    PeerSuspected { address: Address },

    /// The responder is applying a rebalance; retry once `topology_id` is installed.
    #[error("state transfer in progress, waiting for topology {topology_id}")]
    StateTransferInProgress { topology_id: u64 },

    /// The command was issued against ownership older than the responder's.
    #[error("command issued at topology {issued} but responder is at topology {current}")]
    OutdatedTopology { issued: u64, current: u64 },

    #[error("timed out after {timeout:?} waiting for {target} (current topology {current})")]
    TopologyWaitTimeout {
        target: String,
        current: u64,
        timeout: Duration,
    },

    #[error("node {address} did not respond within {timeout:?}")]
    RemoteTimeout { address: Address, timeout: Duration },

    #[error("transport failure: {0}")]
    Transport(String),

    /// Refused by the partition handling policy.
    #[error("key {key} is not available ({reachability:?})")]
    Unavailable {
        key: String,
        reachability: Reachability,
    },

    #[error("unknown transaction {0}")]
    UnknownTransaction(GlobalTransactionId),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Whether the commit path may consume a retry for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::PeerSuspected { .. } | CacheError::StateTransferInProgress { .. }
        )
    }
}
