use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::commands::{
    CommandBody, CommitCommand, GetCommand, InvocationContext, PrepareCommand, Response,
    ResponseValue, RpcCommand, StateRequestCommand, WriteCommand,
};
use crate::config::CacheConfig;
use crate::membership::types::Address;
use crate::storage::DataContainer;
use crate::topology::{CacheTopology, TopologyTarget, TopologyTracker};
use crate::transaction::{RemoteTransaction, TransactionTable};
use crate::transport::CommandHandler;

/// Executes commands other nodes send to this one.
///
/// Every command except reads and state requests first waits for the topology it was issued
/// at, so a command never runs against ownership older than its sender's.
pub struct RemoteCommandHandler {
    local: Address,
    config: CacheConfig,
    tracker: Arc<TopologyTracker>,
    container: Arc<DataContainer>,
    transactions: Arc<TransactionTable>,
}

impl RemoteCommandHandler {
    pub fn new(
        local: Address,
        config: CacheConfig,
        tracker: Arc<TopologyTracker>,
        container: Arc<DataContainer>,
        transactions: Arc<TransactionTable>,
    ) -> Self {
        Self {
            local,
            config,
            tracker,
            container,
            transactions,
        }
    }

    fn owns(&self, topology: &CacheTopology, segment: u32) -> bool {
        !self.config.mode.is_distributed() || topology.is_write_owner(&self.local, segment)
    }

    fn apply(&self, write: &WriteCommand, topology: &CacheTopology) -> ResponseValue {
        self.container
            .apply(write, |segment| self.owns(topology, segment))
            .value
    }

    fn handle_write(&self, command: &RpcCommand, write: &WriteCommand) -> Response {
        let topology = self.tracker.current();
        let keys = write.keys();

        if self.config.mode.is_distributed()
            && command.topology_id < topology.topology_id
            && !keys.is_empty()
        {
            let partitioner = self.container.partitioner();
            let owns_any = keys
                .iter()
                .any(|key| self.owns(&topology, partitioner.get_segment(key)));
            if !owns_any {
                tracing::debug!(
                    "{} issued at topology {} is outdated here (topology {})",
                    write.name(),
                    command.topology_id,
                    topology.topology_id
                );
                return Response::OutdatedTopology {
                    topology_id: topology.topology_id,
                };
            }
        }

        Response::Success(self.apply(write, &topology))
    }

    fn handle_prepare(&self, command: &RpcCommand, prepare: &PrepareCommand) -> Response {
        if self.transactions.is_completed(&prepare.gtx) {
            tracing::debug!("{} already completed, ignoring prepare", prepare.gtx);
            return Response::void();
        }
        let topology = self.tracker.current();
        if topology.is_rebalancing() {
            return Response::StateTransferInProgress {
                topology_id: topology.topology_id + 1,
            };
        }

        if prepare.one_phase {
            for write in &prepare.modifications {
                self.apply(write, &topology);
            }
            self.transactions.mark_completed(&prepare.gtx);
            tracing::debug!("Applied one-phase prepare of {}", prepare.gtx);
        } else {
            self.transactions.put_remote(RemoteTransaction {
                gtx: prepare.gtx.clone(),
                modifications: prepare.modifications.clone(),
                topology_id: command.topology_id,
            });
        }
        Response::void()
    }

    fn handle_commit(&self, commit: &CommitCommand) -> Response {
        if self.transactions.is_completed(&commit.gtx) {
            return Response::void();
        }
        let topology = self.tracker.current();
        if topology.is_rebalancing() {
            return Response::StateTransferInProgress {
                topology_id: topology.topology_id + 1,
            };
        }

        let Some(tx) = self.transactions.take_remote(&commit.gtx) else {
            tracing::info!("No prepared state for {}, asking for a resend", commit.gtx);
            return Response::Success(ResponseValue::ResendPrepare);
        };
        for write in &tx.modifications {
            self.apply(write, &topology);
        }
        self.transactions.mark_completed(&commit.gtx);
        Response::void()
    }

    fn handle_get(&self, get: &GetCommand) -> Response {
        let values: BTreeMap<String, String> = get
            .keys
            .iter()
            .filter_map(|key| self.container.get(key).map(|value| (key.clone(), value)))
            .collect();
        Response::Success(ResponseValue::Values(values))
    }

    fn handle_state_request(&self, request: &StateRequestCommand) -> Response {
        let entries = request
            .segments
            .iter()
            .flat_map(|segment| self.container.dump_segment(*segment))
            .collect();
        Response::Success(ResponseValue::Entries(entries))
    }
}

#[async_trait]
impl CommandHandler for RemoteCommandHandler {
    async fn handle(&self, command: RpcCommand) -> Response {
        let waits_for_topology = !matches!(
            command.body,
            CommandBody::Get(_) | CommandBody::StateRequest(_)
        );
        if waits_for_topology {
            let ctx = InvocationContext::remote(command.origin.clone());
            let target = TopologyTarget::AtLeast(command.topology_id);
            if let Err(e) = self.tracker.await_topology(&ctx, &command, target).await {
                tracing::warn!("Dropping {} from {}: {}", command.name(), command.origin, e);
                return Response::Failure(e.to_string());
            }
        }

        match &command.body {
            CommandBody::Write(write) => self.handle_write(&command, write),
            CommandBody::Prepare(prepare) => self.handle_prepare(&command, prepare),
            CommandBody::Commit(commit) => self.handle_commit(commit),
            CommandBody::Rollback(rollback) => {
                if self.transactions.forget_remote(&rollback.gtx) {
                    tracing::debug!("Rolled back {}", rollback.gtx);
                }
                Response::void()
            }
            CommandBody::Get(get) => self.handle_get(get),
            CommandBody::StateRequest(request) => self.handle_state_request(request),
            CommandBody::ConfirmTopology => Response::void(),
        }
    }
}
