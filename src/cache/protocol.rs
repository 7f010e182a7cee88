//! Client Protocol
//!
//! Endpoints and DTOs of the HTTP API each node serves to clients. Values are plain strings;
//! clients that store structured data serialize it themselves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::membership::types::Address;

// --- API Endpoints ---

pub const ENDPOINT_PUT: &str = "/put";
pub const ENDPOINT_GET: &str = "/get/:key";
pub const ENDPOINT_GET_ALL: &str = "/get_all";
pub const ENDPOINT_PUT_ALL: &str = "/put_all";
pub const ENDPOINT_REMOVE: &str = "/remove/:key";
pub const ENDPOINT_CLEAR: &str = "/clear";
/// Runs a list of operations as one transaction.
pub const ENDPOINT_TX: &str = "/tx";
pub const ENDPOINT_TOPOLOGY: &str = "/admin/topology";
pub const ENDPOINT_REBALANCING: &str = "/admin/rebalancing";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    /// Wait for (or skip waiting for) the backups regardless of the cache mode.
    #[serde(default)]
    pub force_synchronous: bool,
    #[serde(default)]
    pub force_asynchronous: bool,
}

/// Previous (writes) or current (reads) value of a key.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueResponse {
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAllRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntriesResponse {
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutAllRequest {
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutAllResponse {
    pub unavailable: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxOperation {
    Put { key: String, value: String },
    Remove { key: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxRequest {
    pub operations: Vec<TxOperation>,
    /// Roll back instead of committing, after staging every operation.
    #[serde(default)]
    pub rollback: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxResponse {
    pub committed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub topology_id: u64,
    pub view_id: u64,
    pub members: Vec<Address>,
    pub rebalancing: bool,
    pub rebalancing_enabled: bool,
    /// Segments the local node owns (primary or backup).
    pub owned_segments: usize,
    pub local_entries: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RebalancingRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
