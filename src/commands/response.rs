use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::membership::types::Address;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateEntry {
    pub segment: u32,
    pub key: String,
    pub value: String,
}

/// Payload of a successful response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum ResponseValue {
    #[default]
    Void,
    /// Previous (writes) or current (reads) value of a single key.
    Value(Option<String>),
    Values(BTreeMap<String, String>),
    Entries(Vec<StateEntry>),
    /// Reserved marker: the responder lost the prepared state of the transaction being
    /// committed and wants the modifications re-sent as a one-phase prepare.
    ResendPrepare,
}

/// Outcome reported by one responder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Response {
    Success(ResponseValue),
    /// The target was not reachable or had left the view.
    Suspected,
    OutdatedTopology { topology_id: u64 },
    StateTransferInProgress { topology_id: u64 },
    Failure(String),
}

impl Response {
    pub fn void() -> Self {
        Response::Success(ResponseValue::Void)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    pub fn is_resend_prepare(&self) -> bool {
        matches!(self, Response::Success(ResponseValue::ResendPrepare))
    }

    pub fn value(&self) -> Option<&ResponseValue> {
        match self {
            Response::Success(value) => Some(value),
            _ => None,
        }
    }
}

pub type ResponseMap = HashMap<Address, Response>;
