use std::collections::BTreeSet;
use std::sync::Arc;

use super::hash::assign_owners;
use crate::membership::types::Address;

/// Segment ownership: for every segment, its owners in order, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHash {
    members: Vec<Address>,
    owners: Vec<Vec<Address>>,
}

impl ConsistentHash {
    pub fn new(members: &[Address], num_segments: u32, num_owners: usize) -> Self {
        let mut sorted = members.to_vec();
        sorted.sort();
        sorted.dedup();
        let owners = assign_owners(&sorted, num_segments, num_owners);
        Self {
            members: sorted,
            owners,
        }
    }

    /// Every member owns every segment.
    pub fn replicated(members: &[Address], num_segments: u32) -> Self {
        Self::new(members, num_segments, members.len())
    }

    pub fn num_segments(&self) -> u32 {
        self.owners.len() as u32
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn locate_owners(&self, segment: u32) -> &[Address] {
        self.owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary(&self, segment: u32) -> Option<&Address> {
        self.locate_owners(segment).first()
    }

    pub fn is_owner(&self, address: &Address, segment: u32) -> bool {
        self.locate_owners(segment).contains(address)
    }

    pub fn segments_owned_by(&self, address: &Address) -> BTreeSet<u32> {
        (0..self.num_segments())
            .filter(|segment| self.is_owner(address, *segment))
            .collect()
    }

    /// Removes `leavers` from every owner list, keeping the order of the survivors.
    ///
    /// Segments whose owners all left end up with no owner at all; nothing is reassigned.
    pub fn without(&self, leavers: &[Address]) -> Self {
        Self {
            members: self
                .members
                .iter()
                .filter(|member| !leavers.contains(member))
                .cloned()
                .collect(),
            owners: self
                .owners
                .iter()
                .map(|owners| {
                    owners
                        .iter()
                        .filter(|owner| !leavers.contains(owner))
                        .cloned()
                        .collect()
                })
                .collect(),
        }
    }
}

/// A published, immutable ownership snapshot for the cache.
///
/// While `pending` is set a rebalance is in flight: reads still use `current`, writes go
/// to the owners in both.
#[derive(Debug, Clone)]
pub struct CacheTopology {
    pub topology_id: u64,
    /// View the topology was derived from.
    pub view_id: u64,
    pub current: Arc<ConsistentHash>,
    pub pending: Option<Arc<ConsistentHash>>,
    pub members: Vec<Address>,
    pub previous: Option<Arc<CacheTopology>>,
}

impl CacheTopology {
    pub fn new(
        topology_id: u64,
        view_id: u64,
        current: Arc<ConsistentHash>,
        pending: Option<Arc<ConsistentHash>>,
        members: Vec<Address>,
    ) -> Self {
        Self {
            topology_id,
            view_id,
            current,
            pending,
            members,
            previous: None,
        }
    }

    /// A later topology that remembers this one. Only one level of history is kept.
    pub fn successor(
        &self,
        topology_id: u64,
        view_id: u64,
        current: Arc<ConsistentHash>,
        pending: Option<Arc<ConsistentHash>>,
        members: Vec<Address>,
    ) -> Self {
        Self {
            topology_id,
            view_id,
            current,
            pending,
            members,
            previous: Some(Arc::new(Self {
                previous: None,
                ..self.clone()
            })),
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_member(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    pub fn num_segments(&self) -> u32 {
        self.current.num_segments()
    }

    pub fn read_owners(&self, segment: u32) -> &[Address] {
        self.current.locate_owners(segment)
    }

    pub fn write_owners(&self, segment: u32) -> Vec<Address> {
        let mut owners = self.current.locate_owners(segment).to_vec();
        if let Some(pending) = &self.pending {
            for owner in pending.locate_owners(segment) {
                if !owners.contains(owner) {
                    owners.push(owner.clone());
                }
            }
        }
        owners
    }

    pub fn is_read_owner(&self, address: &Address, segment: u32) -> bool {
        self.current.is_owner(address, segment)
    }

    pub fn is_write_owner(&self, address: &Address, segment: u32) -> bool {
        self.current.is_owner(address, segment)
            || self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.is_owner(address, segment))
    }
}
