//! Command Model
//!
//! Everything one node asks another node to do travels as an [`RpcCommand`]: an envelope
//! carrying the originating address and the topology id the command was issued at, around a
//! [`CommandBody`].
//!
//! ## Command kinds
//! - **Writes** (`put`, `put_all`, `remove`, `replace`, `clear`): applied locally first, then
//!   replicated with the caller's [`Flags`] copied on so the remote side behaves identically.
//! - **Transaction boundaries** (`prepare`, `commit`, `rollback`): correlated by
//!   [`GlobalTransactionId`].
//! - **Reads and state transfer** (`get`, `state_request`): routed to owners.
//!
//! Remote nodes answer with a [`Response`]; the reserved [`ResponseValue::ResendPrepare`]
//! marker asks the originator to re-send a transaction's modifications as a one-phase prepare.

pub mod context;
pub mod flags;
pub mod response;
pub mod tx;
pub mod write;


pub use context::{InvocationContext, Origin};
pub use flags::Flags;
pub use response::{Response, ResponseMap, ResponseValue, StateEntry};
pub use tx::{CommitCommand, GlobalTransactionId, PrepareCommand, RollbackCommand};
pub use write::{WriteCommand, WriteKind};

use serde::{Deserialize, Serialize};

use crate::membership::types::Address;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetCommand {
    pub keys: Vec<String>,
}

/// Asks a current owner for the entries of segments the requester is about to own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRequestCommand {
    pub segments: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CommandBody {
    Write(WriteCommand),
    Prepare(PrepareCommand),
    Commit(CommitCommand),
    Rollback(RollbackCommand),
    Get(GetCommand),
    StateRequest(StateRequestCommand),
    /// Answered once the responder has installed the command's topology. A node that
    /// finished a rebalance sends it before dropping the segments it gave away.
    ConfirmTopology,
}

impl CommandBody {
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Write(write) => write.name(),
            CommandBody::Prepare(_) => "prepare",
            CommandBody::Commit(_) => "commit",
            CommandBody::Rollback(_) => "rollback",
            CommandBody::Get(_) => "get",
            CommandBody::StateRequest(_) => "state_request",
            CommandBody::ConfirmTopology => "confirm_topology",
        }
    }

    /// The transaction this command belongs to, if it is a transaction boundary.
    pub fn transaction(&self) -> Option<&GlobalTransactionId> {
        match self {
            CommandBody::Prepare(prepare) => Some(&prepare.gtx),
            CommandBody::Commit(commit) => Some(&commit.gtx),
            CommandBody::Rollback(rollback) => Some(&rollback.gtx),
            _ => None,
        }
    }
}

/// Envelope for every inter-node command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcCommand {
    pub origin: Address,
    /// Topology the originator saw when it issued the command. The responder waits until
    /// it has installed at least this topology before executing.
    pub topology_id: u64,
    pub body: CommandBody,
}

impl RpcCommand {
    pub fn new(origin: Address, topology_id: u64, body: CommandBody) -> Self {
        Self {
            origin,
            topology_id,
            body,
        }
    }

    pub fn name(&self) -> &'static str {
        self.body.name()
    }
}
