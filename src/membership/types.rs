use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Logical name of a cluster member.
///
/// Addresses are totally ordered so every node derives the same segment ownership
/// from the same member set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Generates a unique member name for nodes started without `--name`.
    pub fn random() -> Self {
        Self(format!("node-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable snapshot of the cluster membership.
///
/// A new view (with a strictly greater `view_id`) replaces the old one wholesale on every
/// membership change. The first member is the view coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterView {
    pub view_id: u64,
    pub members: Vec<Address>,
}

impl ClusterView {
    /// Builds a view, dropping duplicate members while keeping their first position.
    pub fn new(view_id: u64, members: impl IntoIterator<Item = Address>) -> Self {
        let mut unique: Vec<Address> = Vec::new();
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Self {
            view_id,
            members: unique,
        }
    }

    /// The view a node starts with before it has heard from anyone else.
    pub fn singleton(local: Address) -> Self {
        Self::new(0, [local])
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Members of `self` that are absent from `newer`.
    pub fn leavers(&self, newer: &ClusterView) -> Vec<Address> {
        self.members
            .iter()
            .filter(|member| !newer.contains(member))
            .cloned()
            .collect()
    }

    /// Members of `newer` that are absent from `self`.
    pub fn joiners(&self, newer: &ClusterView) -> Vec<Address> {
        newer.leavers(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// A single member as seen by the gossip layer.
///
/// `incarnation` is a logical clock used to order updates and refute false suspicion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub address: Address,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The gossip wire protocol.
///
/// - `Ping/Ack`: liveness checks and member list exchange.
/// - `Join`: sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: disseminates changes in node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: Address,
        incarnation: u64,
    },

    Ack {
        from: Address,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        address: Address,
        incarnation: u64,
    },

    Alive {
        address: Address,
        incarnation: u64,
    },
}
