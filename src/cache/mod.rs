//! Cache Module
//!
//! The public face of a cache node: the key/value API, transactions, and the HTTP surface
//! built on top of them.
//!
//! ## Core Concepts
//! - **CacheNode**: wires the topology tracker, storage, partition policy, replication
//!   coordinator and remote handler together around one [`Transport`](crate::transport::Transport).
//! - **Reads**: served locally when this node owns the key, otherwise from the reachable
//!   owners in order, falling back to the next one on failure.
//! - **Writes**: go through the replication coordinator.
//! - **Transactions**: staged locally and propagated at commit with two-phase commit.

pub mod handlers;
pub mod node;
pub mod protocol;
pub mod tx;


pub use node::{CacheNode, PutAllOutcome};
pub use tx::Transaction;
