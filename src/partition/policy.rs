use crate::config::CacheMode;
use crate::error::{CacheError, Result};
use crate::membership::types::{Address, ClusterView};
use crate::topology::{CacheTopology, KeyPartitioner};

use super::{PartitionHandling, Reachability};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAvailability {
    pub segment: u32,
    pub reachability: Reachability,
    /// Read owners that are still in the view, primary first.
    pub owners: Vec<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    Proceed,
    /// No owner is reachable; answer as if the key were absent.
    Absent,
}

pub struct PartitionPolicyEvaluator {
    policy: PartitionHandling,
    mode: CacheMode,
    num_owners: usize,
    partitioner: KeyPartitioner,
}

impl PartitionPolicyEvaluator {
    pub fn new(
        policy: PartitionHandling,
        mode: CacheMode,
        num_owners: usize,
        partitioner: KeyPartitioner,
    ) -> Self {
        Self {
            policy,
            mode,
            num_owners,
            partitioner,
        }
    }

    pub fn policy(&self) -> PartitionHandling {
        self.policy
    }

    pub fn classify(
        &self,
        key: &str,
        topology: &CacheTopology,
        view: &ClusterView,
    ) -> KeyAvailability {
        let segment = self.partitioner.get_segment(key);
        let owners: Vec<Address> = topology
            .read_owners(segment)
            .iter()
            .filter(|owner| view.contains(owner))
            .cloned()
            .collect();

        if !self.mode.is_clustered() {
            return KeyAvailability {
                segment,
                reachability: Reachability::FullyOwned,
                owners,
            };
        }

        let members = topology.members.len().max(1);
        let expected = if self.mode.is_replicated() {
            members
        } else {
            self.num_owners.min(members)
        };

        let reachability = if owners.is_empty() {
            Reachability::Unreachable
        } else if owners.len() >= expected {
            Reachability::FullyOwned
        } else {
            Reachability::Degraded
        };
        KeyAvailability {
            segment,
            reachability,
            owners,
        }
    }

    pub fn classify_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        topology: &CacheTopology,
        view: &ClusterView,
    ) -> Vec<(String, KeyAvailability)> {
        keys.into_iter()
            .map(|key| (key.to_string(), self.classify(key, topology, view)))
            .collect()
    }

    pub fn read_decision(&self, key: &str, availability: &KeyAvailability) -> Result<ReadDecision> {
        match (self.policy, availability.reachability) {
            (_, Reachability::FullyOwned) => Ok(ReadDecision::Proceed),
            (PartitionHandling::DenyReadWrites, reachability) => Err(CacheError::Unavailable {
                key: key.to_string(),
                reachability,
            }),
            (_, Reachability::Degraded) => Ok(ReadDecision::Proceed),
            (_, Reachability::Unreachable) => Ok(ReadDecision::Absent),
        }
    }

    pub fn write_decision(&self, key: &str, availability: &KeyAvailability) -> Result<()> {
        let allowed = matches!(
            (self.policy, availability.reachability),
            (_, Reachability::FullyOwned)
                | (PartitionHandling::AllowReadWrites, Reachability::Degraded)
        );
        if allowed {
            Ok(())
        } else {
            Err(CacheError::Unavailable {
                key: key.to_string(),
                reachability: availability.reachability,
            })
        }
    }
}
