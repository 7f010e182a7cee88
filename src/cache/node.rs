use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::tx::Transaction;
use crate::commands::{
    CommandBody, Flags, GetCommand, InvocationContext, ResponseValue, RpcCommand, WriteCommand,
};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::membership::types::Address;
use crate::partition::{PartitionPolicyEvaluator, ReadDecision};
use crate::replication::{RemoteCommandHandler, ReplicationCoordinator, WriteResult};
use crate::storage::DataContainer;
use crate::topology::{
    CacheTopology, KeyPartitioner, StateTransfer, TopologyManager, TopologyTracker,
};
use crate::transaction::TransactionTable;
use crate::transport::local::LocalCluster;
use crate::transport::{CommandHandler, Recipients, RpcOptions, Transport};

/// Outcome of a batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutAllOutcome {
    /// Keys skipped because no owner was reachable.
    pub unavailable: Vec<String>,
}

/// One member of a clustered cache.
pub struct CacheNode {
    local: Address,
    config: CacheConfig,
    transport: Arc<dyn Transport>,
    tracker: Arc<TopologyTracker>,
    container: Arc<DataContainer>,
    transactions: Arc<TransactionTable>,
    evaluator: Arc<PartitionPolicyEvaluator>,
    coordinator: ReplicationCoordinator,
    handler: Arc<RemoteCommandHandler>,
    manager: Arc<TopologyManager>,
}

impl CacheNode {
    pub fn new(config: CacheConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let local = transport.local_address().clone();
        let partitioner = KeyPartitioner::new(config.num_segments);

        let tracker = Arc::new(TopologyTracker::new(
            local.clone(),
            config.num_segments,
            config.topology_wait_timeout,
        ));
        let container = Arc::new(DataContainer::new(partitioner));
        let transactions = Arc::new(TransactionTable::new(local.clone()));
        let evaluator = Arc::new(PartitionPolicyEvaluator::new(
            config.partition_handling,
            config.mode,
            config.num_owners,
            partitioner,
        ));

        let coordinator = ReplicationCoordinator::new(
            config.clone(),
            tracker.clone(),
            transport.clone(),
            evaluator.clone(),
            container.clone(),
            transactions.clone(),
        );
        let handler = Arc::new(RemoteCommandHandler::new(
            local.clone(),
            config.clone(),
            tracker.clone(),
            container.clone(),
            transactions.clone(),
        ));
        let state_transfer = StateTransfer::new(
            local.clone(),
            transport.clone(),
            container.clone(),
            config.remote_timeout,
        );
        let manager = TopologyManager::new(
            local.clone(),
            config.clone(),
            tracker.clone(),
            state_transfer,
            container.clone(),
            transactions.clone(),
        );

        tracing::info!(
            "Cache '{}' on {} ({:?}, {} segments)",
            config.name,
            local,
            config.mode,
            config.num_segments
        );

        Ok(Arc::new(Self {
            local,
            config,
            transport,
            tracker,
            container,
            transactions,
            evaluator,
            coordinator,
            handler,
            manager,
        }))
    }

    /// Creates a node on an in-process cluster, registers it and starts it.
    pub fn in_process(
        cluster: &Arc<LocalCluster>,
        name: &str,
        config: CacheConfig,
    ) -> Result<Arc<Self>> {
        let address = Address::new(name);
        let transport = Arc::new(cluster.transport(address.clone()));
        let node = Self::new(config, transport)?;
        cluster.register(address, node.handler());
        node.start();
        Ok(node)
    }

    /// Spawns the topology manager on the transport's view stream.
    pub fn start(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let views = self.transport.subscribe_views();
        tokio::spawn(manager.run(views))
    }

    pub fn address(&self) -> &Address {
        &self.local
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The inbound side, to be registered with the transport.
    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        self.handler.clone()
    }

    pub fn topology(&self) -> Arc<CacheTopology> {
        self.tracker.current()
    }

    pub fn tracker(&self) -> &Arc<TopologyTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &ReplicationCoordinator {
        &self.coordinator
    }

    pub(crate) fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    /// Number of entries held on this node.
    pub fn local_size(&self) -> usize {
        self.container.entry_count()
    }

    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        self.manager.set_rebalancing_enabled(enabled);
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.manager.is_rebalancing_enabled()
    }

    /// Waits until this node runs a stable topology for view `view_id` or later.
    pub async fn await_view(&self, view_id: u64) -> Result<Arc<CacheTopology>> {
        self.tracker.await_view(view_id).await
    }

    // ============================================================
    // READS
    // ============================================================

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.config.mode.is_clustered() {
            return Ok(self.container.get(key));
        }
        let topology = self.tracker.current();
        let view = self.tracker.view();
        let availability = self.evaluator.classify(key, &topology, &view);
        if self.evaluator.read_decision(key, &availability)? == ReadDecision::Absent {
            tracing::debug!("No reachable owner for {}, reading as absent", key);
            return Ok(None);
        }
        if topology.is_read_owner(&self.local, availability.segment) {
            return Ok(self.container.get(key));
        }

        let mut values = self
            .remote_get(vec![key.to_string()], &availability.owners, &topology)
            .await?;
        Ok(values.remove(key))
    }

    /// Reads several keys, asking each remote owner once for all the keys it is first in
    /// line for. Absent and unreachable keys are missing from the result.
    pub async fn get_all(&self, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        if !self.config.mode.is_clustered() {
            for key in keys {
                if let Some(value) = self.container.get(key) {
                    found.insert(key.to_string(), value);
                }
            }
            return Ok(found);
        }

        let topology = self.tracker.current();
        let view = self.tracker.view();
        let mut remote: HashMap<Vec<Address>, Vec<String>> = HashMap::new();
        for key in keys {
            let availability = self.evaluator.classify(key, &topology, &view);
            if self.evaluator.read_decision(key, &availability)? == ReadDecision::Absent {
                continue;
            }
            if topology.is_read_owner(&self.local, availability.segment) {
                if let Some(value) = self.container.get(key) {
                    found.insert(key.to_string(), value);
                }
                continue;
            }
            remote
                .entry(availability.owners)
                .or_default()
                .push(key.to_string());
        }

        for (owners, keys) in remote {
            found.extend(self.remote_get(keys, &owners, &topology).await?);
        }
        Ok(found)
    }

    /// Tries `owners` in order until one answers.
    async fn remote_get(
        &self,
        keys: Vec<String>,
        owners: &[Address],
        topology: &CacheTopology,
    ) -> Result<BTreeMap<String, String>> {
        let command = RpcCommand::new(
            self.local.clone(),
            topology.topology_id,
            CommandBody::Get(GetCommand { keys }),
        );
        let options = RpcOptions::synchronous(self.config.remote_timeout);
        let mut last_error = None;

        for owner in owners.iter().filter(|owner| **owner != self.local) {
            let recipients = Recipients::Only(vec![owner.clone()]);
            match self
                .transport
                .invoke_remotely(&recipients, &command, options)
                .await
            {
                Ok(mut responses) => {
                    if let Some(ResponseValue::Values(values)) =
                        responses.remove(owner).as_ref().and_then(|r| r.value())
                    {
                        return Ok(values.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!("Read from {} failed, trying next owner: {}", owner, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(BTreeMap::new()),
        }
    }

    // ============================================================
    // WRITES
    // ============================================================

    async fn write(&self, ctx: InvocationContext, command: WriteCommand) -> Result<WriteResult> {
        self.coordinator.handle_write(&ctx, command).await
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.put_with_flags(key, value, Flags::empty()).await
    }

    pub async fn put_with_flags(
        &self,
        key: &str,
        value: &str,
        flags: Flags,
    ) -> Result<Option<String>> {
        let ctx = InvocationContext::local().with_flags(flags);
        let result = self.write(ctx, WriteCommand::put(key, value)).await?;
        Ok(single_value(result.value))
    }

    /// Applies the put locally and hands back the replication as a future.
    pub async fn put_async(&self, key: &str, value: &str) -> Result<WriteResult> {
        let ctx = InvocationContext::local().with_future_return();
        self.write(ctx, WriteCommand::put(key, value)).await
    }

    pub async fn put_all(&self, entries: BTreeMap<String, String>) -> Result<PutAllOutcome> {
        let result = self
            .write(InvocationContext::local(), WriteCommand::put_all(entries))
            .await?;
        Ok(PutAllOutcome {
            unavailable: result.unavailable,
        })
    }

    pub async fn remove(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .write(InvocationContext::local(), WriteCommand::remove(key))
            .await?;
        Ok(single_value(result.value))
    }

    /// Replaces the value of an existing key. Returns the previous value, `None` if the key
    /// was absent (and nothing was written).
    pub async fn replace(&self, key: &str, value: &str) -> Result<Option<String>> {
        let result = self
            .write(
                InvocationContext::local(),
                WriteCommand::replace(key, None, value),
            )
            .await?;
        Ok(single_value(result.value))
    }

    /// Replaces the value only if it currently equals `expected`.
    pub async fn replace_if(&self, key: &str, expected: &str, value: &str) -> Result<bool> {
        let command = WriteCommand::replace(key, Some(expected.to_string()), value);
        let result = self.write(InvocationContext::local(), command).await?;
        Ok(single_value(result.value).as_deref() == Some(expected))
    }

    pub async fn clear(&self) -> Result<()> {
        self.write(InvocationContext::local(), WriteCommand::clear())
            .await?;
        Ok(())
    }

    // ============================================================
    // TRANSACTIONS
    // ============================================================

    pub fn begin(&self) -> Transaction<'_> {
        let gtx = self.transactions.begin();
        tracing::debug!("Started {}", gtx);
        Transaction::new(self, gtx)
    }
}

fn single_value(value: ResponseValue) -> Option<String> {
    match value {
        ResponseValue::Value(value) => value,
        _ => None,
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("address", &self.local)
            .field("topology", &self.tracker.topology_id())
            .finish()
    }
}
