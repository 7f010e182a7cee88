//! Transport Module
//!
//! Moves [`RpcCommand`]s between nodes and turns what comes back into a [`ResponseMap`] or a
//! [`CacheError`].
//!
//! ## Core Concepts
//! - **Transport**: the outbound seam. The coordinator only ever talks to `dyn Transport`,
//!   so the same code runs over HTTP in production and over [`local::LocalCluster`] in tests.
//! - **CommandHandler**: the inbound seam, implemented by the remote command handler.
//! - **Response modes**: synchronous calls fail on a suspected target; the ignore-leavers
//!   variant keeps such targets as `Suspected` entries; asynchronous calls return at once.

pub mod http;
pub mod local;


use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::commands::{Response, ResponseMap, RpcCommand};
use crate::error::{CacheError, Result};
use crate::membership::types::{Address, ClusterView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every member of the current view except the local node.
    All,
    Only(Vec<Address>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Synchronous,
    SynchronousIgnoreLeavers,
    Asynchronous,
}

impl ResponseMode {
    pub fn is_synchronous(self) -> bool {
        !matches!(self, ResponseMode::Asynchronous)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RpcOptions {
    pub mode: ResponseMode,
    /// Per-target bound on a synchronous call.
    pub timeout: Duration,
}

impl RpcOptions {
    pub fn synchronous(timeout: Duration) -> Self {
        Self {
            mode: ResponseMode::Synchronous,
            timeout,
        }
    }

    pub fn ignore_leavers(timeout: Duration) -> Self {
        Self {
            mode: ResponseMode::SynchronousIgnoreLeavers,
            timeout,
        }
    }

    pub fn asynchronous(timeout: Duration) -> Self {
        Self {
            mode: ResponseMode::Asynchronous,
            timeout,
        }
    }

    pub fn with_mode(self, mode: ResponseMode) -> Self {
        Self { mode, ..self }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_address(&self) -> &Address;

    fn view(&self) -> Arc<ClusterView>;

    fn subscribe_views(&self) -> watch::Receiver<Arc<ClusterView>>;

    /// Sends `command` to `recipients`. The local node is never a target.
    ///
    /// Asynchronous invocations return an empty map as soon as the sends are started.
    async fn invoke_remotely(
        &self,
        recipients: &Recipients,
        command: &RpcCommand,
        options: RpcOptions,
    ) -> Result<ResponseMap>;
}

/// Runs a synchronous invocation on a background task.
pub fn invoke_in_future(
    transport: Arc<dyn Transport>,
    recipients: Recipients,
    command: RpcCommand,
    options: RpcOptions,
) -> ReplicationFuture {
    ReplicationFuture::spawn(async move {
        transport
            .invoke_remotely(&recipients, &command, options)
            .await
    })
}

/// Executes commands sent by other nodes.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: RpcCommand) -> Response;
}

/// Expands `recipients` against `view`, dropping the local node.
pub fn resolve_recipients(
    recipients: &Recipients,
    view: &ClusterView,
    local: &Address,
) -> Vec<Address> {
    let targets: Vec<Address> = match recipients {
        Recipients::All => view.members.clone(),
        Recipients::Only(addresses) => addresses.clone(),
    };
    let mut resolved: Vec<Address> = Vec::with_capacity(targets.len());
    for target in targets {
        if &target != local && !resolved.contains(&target) {
            resolved.push(target);
        }
    }
    resolved
}

/// Folds per-target outcomes into a response map, or the error the caller should see.
///
/// A non-retryable error wins over a retryable one, so a commit is never retried on top of a
/// failure that retrying cannot fix.
pub fn collect_responses(
    mode: ResponseMode,
    issued_topology: u64,
    outcomes: Vec<(Address, Result<Response>)>,
) -> Result<ResponseMap> {
    let mut responses = ResponseMap::with_capacity(outcomes.len());
    let mut error: Option<CacheError> = None;

    let mut record = |candidate: CacheError| {
        let replace = match &error {
            None => true,
            Some(existing) => existing.is_retryable() && !candidate.is_retryable(),
        };
        if replace {
            error = Some(candidate);
        }
    };

    for (address, outcome) in outcomes {
        match outcome {
            Ok(Response::Suspected) if mode == ResponseMode::SynchronousIgnoreLeavers => {
                responses.insert(address, Response::Suspected);
            }
            Ok(Response::Suspected) => record(CacheError::PeerSuspected { address }),
            Ok(Response::Failure(message)) => {
                record(CacheError::Transport(format!("{address}: {message}")))
            }
            Ok(Response::OutdatedTopology { topology_id }) => {
                record(CacheError::OutdatedTopology {
                    issued: issued_topology,
                    current: topology_id,
                })
            }
            Ok(Response::StateTransferInProgress { topology_id }) => {
                record(CacheError::StateTransferInProgress { topology_id })
            }
            Ok(response) => {
                responses.insert(address, response);
            }
            Err(e) => record(e),
        }
    }

    match error {
        Some(error) => Err(error),
        None => Ok(responses),
    }
}

/// Handle on a replication running in the background.
pub struct ReplicationFuture {
    handle: JoinHandle<Result<ResponseMap>>,
}

impl ReplicationFuture {
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<ResponseMap>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub async fn wait(self) -> Result<ResponseMap> {
        self.handle
            .await
            .map_err(|e| CacheError::Transport(format!("replication task failed: {e}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
