//! Replicated Cache Library
//!
//! The replication and state-transfer engine of a clustered in-memory cache. It serves as
//! the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`membership`**: UDP gossip (SWIM-like) that turns node health into cluster views.
//! - **`topology`**: segment ownership, versioned topologies, the tracker commands wait on,
//!   and the manager that publishes topologies and runs state transfer.
//! - **`partition`**: what may be read or written while owners are missing.
//! - **`commands`**: the commands nodes exchange, their flags and responses.
//! - **`transport`**: sending commands to other nodes, over HTTP or in-process.
//! - **`replication`**: local-first write propagation, two-phase commit with resend and
//!   bounded retry, and execution of remote commands.
//! - **`transaction`**: per-node transaction bookkeeping.
//! - **`storage`**: the node-local, segment-sharded data container.
//! - **`cache`**: the `CacheNode` API and its HTTP surface.

pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod membership;
pub mod partition;
pub mod replication;
pub mod storage;
pub mod topology;
pub mod transaction;
pub mod transport;

pub use cache::{CacheNode, Transaction};
pub use config::{CacheConfig, CacheMode};
pub use error::CacheError;
