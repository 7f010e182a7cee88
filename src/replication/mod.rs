//! Replication Module
//!
//! Propagates writes and transaction boundaries to the nodes that own the affected keys,
//! and executes the commands other nodes send here.
//!
//! ## Core Concepts
//! - **Local first**: a non-transactional write is applied on this node before it is sent
//!   anywhere, and only a successful, locally originated, non-transactional write is sent.
//! - **Topology sync**: every send waits for a stable topology at least as new as the one
//!   the command was issued at, so nothing races ahead of a rebalance.
//! - **Commit resend**: a participant that lost its prepared state answers the commit with
//!   the resend marker and receives the modifications again as a one-phase prepare.
//! - **Bounded retry**: only the commit step retries, on a suspected peer or a state transfer
//!   in progress, at most `commit_retries` times.

pub mod coordinator;
pub mod remote;
pub mod retry;

#[cfg(test)]
mod tests;

pub use coordinator::{ReplicationCoordinator, WriteResult};
pub use remote::RemoteCommandHandler;
pub use retry::{Attempt, RetryBudget};
