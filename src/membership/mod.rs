//! Membership & Discovery Module
//!
//! Implements a Gossip-based membership protocol (inspired by SWIM) and turns its member
//! list into the sequence of cluster views the cache reacts to.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: nodes periodically exchange member lists over UDP.
//! - **Failure Detection**: a "Suspect" -> "Dead" transition with timeouts handles crashes.
//! - **Incarnation Numbers**: settle disputes about a node's state (Alive/Suspect).
//! - **Cluster Views**: every change of the non-dead member set is published as a new
//!   [`ClusterView`](types::ClusterView) on a watch channel.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
