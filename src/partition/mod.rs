//! Partition Handling Module
//!
//! Decides what a node may read or write while some owners of a key are missing from the
//! cluster view (crashed, or on the other side of a network split).
//!
//! ## Core Concepts
//! - **Reachability**: a key is `FullyOwned` when all the owners it should have are in the
//!   view, `Degraded` when only some are, `Unreachable` when none are.
//! - **Policy**: `DenyReadWrites` refuses anything not fully owned, `AllowReads` still
//!   serves reads, `AllowReadWrites` keeps working against the surviving owners.
//! - Under the allow policies an unreachable key reads as absent, not as an error.

pub mod policy;

#[cfg(test)]
mod tests;

pub use policy::{KeyAvailability, PartitionPolicyEvaluator, ReadDecision};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionHandling {
    DenyReadWrites,
    AllowReads,
    #[default]
    AllowReadWrites,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reachability {
    FullyOwned,
    Degraded,
    Unreachable,
}
