//! Topology Module
//!
//! Tracks which nodes own which part of the key space, and lets commands wait for the
//! ownership they were issued against.
//!
//! ## Core Concepts
//! - **Segments**: keys hash into a fixed number of segments; a [`ConsistentHash`] lists the
//!   owners of each segment, primary first.
//! - **CacheTopology**: an immutable, versioned snapshot. While a rebalance is in flight it
//!   also carries the pending ownership; writes go to both, reads to the current one.
//! - **Tracker**: lock-free reads of the installed topology plus async waits for a later or
//!   stable one, all bounded by the configured timeout.
//! - **Manager**: the only publisher. Turns cluster views into topologies and runs state
//!   transfer when rebalancing is enabled.

pub mod hash;
pub mod manager;
pub mod state_transfer;
pub mod tracker;
pub mod types;


pub use hash::KeyPartitioner;
pub use manager::TopologyManager;
pub use state_transfer::StateTransfer;
pub use tracker::{TopologyTarget, TopologyTracker};
pub use types::{CacheTopology, ConsistentHash};
