use serde::{Deserialize, Serialize};
use std::fmt;

use super::write::WriteCommand;
use crate::membership::types::Address;

/// Cluster-wide transaction identity: the originating node plus a per-node sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GlobalTransactionId {
    pub origin: Address,
    pub id: u64,
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.origin, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrepareCommand {
    pub gtx: GlobalTransactionId,
    pub modifications: Vec<WriteCommand>,
    /// Apply immediately instead of waiting for a commit.
    pub one_phase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitCommand {
    pub gtx: GlobalTransactionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackCommand {
    pub gtx: GlobalTransactionId,
}
