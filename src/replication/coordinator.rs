use std::sync::Arc;

use super::retry::{Attempt, RetryBudget};
use crate::commands::{
    CommandBody, CommitCommand, Flags, GlobalTransactionId, InvocationContext, PrepareCommand,
    ResponseMap, ResponseValue, RollbackCommand, RpcCommand, WriteCommand, WriteKind,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::membership::types::Address;
use crate::partition::PartitionPolicyEvaluator;
use crate::storage::DataContainer;
use crate::topology::{CacheTopology, TopologyTarget, TopologyTracker};
use crate::transaction::{LocalTransaction, TransactionTable};
use crate::transport::{Recipients, ReplicationFuture, RpcOptions, Transport, invoke_in_future};

/// What a write produced on the invoking node.
#[derive(Default)]
pub struct WriteResult {
    /// Previous value(s) of the written key(s).
    pub value: ResponseValue,
    /// Keys of a batch write that were skipped because no owner was reachable.
    pub unavailable: Vec<String>,
    /// Set when the caller asked for a future instead of waiting for replication.
    pub replication: Option<ReplicationFuture>,
}

impl WriteResult {
    fn local(value: ResponseValue, unavailable: Vec<String>) -> Self {
        Self {
            value,
            unavailable,
            replication: None,
        }
    }
}

/// Originator side of replication: non-transactional writes and the two-phase protocol.
pub struct ReplicationCoordinator {
    local: Address,
    config: CacheConfig,
    tracker: Arc<TopologyTracker>,
    transport: Arc<dyn Transport>,
    evaluator: Arc<PartitionPolicyEvaluator>,
    container: Arc<DataContainer>,
    transactions: Arc<TransactionTable>,
}

impl ReplicationCoordinator {
    pub fn new(
        config: CacheConfig,
        tracker: Arc<TopologyTracker>,
        transport: Arc<dyn Transport>,
        evaluator: Arc<PartitionPolicyEvaluator>,
        container: Arc<DataContainer>,
        transactions: Arc<TransactionTable>,
    ) -> Self {
        Self {
            local: transport.local_address().clone(),
            config,
            tracker,
            transport,
            evaluator,
            container,
            transactions,
        }
    }

    // ============================================================
    // NON-TRANSACTIONAL WRITES
    // ============================================================

    pub async fn handle_write(
        &self,
        ctx: &InvocationContext,
        mut command: WriteCommand,
    ) -> Result<WriteResult> {
        command.flags |= ctx.flags;

        if let Some(gtx) = &ctx.transaction {
            tracing::debug!("Staging {} in {}", command.name(), gtx);
            self.transactions.add_modification(gtx, command)?;
            return Ok(WriteResult::default());
        }

        let topology = self.tracker.current();
        let unavailable = self.check_write_availability(ctx, &mut command, &topology)?;

        let outcome = self
            .container
            .apply(&command, |segment| self.owns_for_write(ctx, &topology, segment));
        command.successful = outcome.successful;

        if !self.should_replicate(ctx, &command) {
            return Ok(WriteResult::local(outcome.value, unavailable));
        }

        let mut issued = RpcCommand::new(
            self.local.clone(),
            topology.topology_id,
            CommandBody::Write(command.clone()),
        );
        let topology = self
            .tracker
            .await_stable_topology(ctx, &issued, TopologyTarget::AtLeast(topology.topology_id))
            .await?;
        issued.topology_id = topology.topology_id;

        let recipients = self.write_recipients(&command, &topology);
        if let Recipients::Only(targets) = &recipients
            && targets.is_empty()
        {
            return Ok(WriteResult::local(outcome.value, unavailable));
        }

        let options = if self.is_synchronous(&command.flags) {
            RpcOptions::synchronous(self.config.remote_timeout)
        } else {
            RpcOptions::asynchronous(self.config.remote_timeout)
        };

        if ctx.use_future_return && options.mode.is_synchronous() {
            let replication =
                invoke_in_future(self.transport.clone(), recipients, issued, options);
            return Ok(WriteResult {
                value: outcome.value,
                unavailable,
                replication: Some(replication),
            });
        }

        let responses = self
            .transport
            .invoke_remotely(&recipients, &issued, options)
            .await?;

        let value = if outcome.applied_keys.is_empty() && !command.is_clear() {
            self.primary_answer(&command, &topology, &responses)
                .unwrap_or(outcome.value)
        } else {
            outcome.value
        };
        Ok(WriteResult::local(value, unavailable))
    }

    /// Applies the partition policy. Batch writes drop the keys they cannot write and report
    /// them; every other write fails on the first refused key.
    fn check_write_availability(
        &self,
        ctx: &InvocationContext,
        command: &mut WriteCommand,
        topology: &CacheTopology,
    ) -> Result<Vec<String>> {
        if !self.config.mode.is_clustered() || ctx.is_local_mode_forced() {
            return Ok(Vec::new());
        }
        let view = self.tracker.view();

        if matches!(command.kind, WriteKind::PutAll { .. }) {
            let evaluator = &self.evaluator;
            let unavailable = command.retain_keys(|key| {
                let availability = evaluator.classify(key, topology, &view);
                evaluator.write_decision(key, &availability).is_ok()
            });
            if !unavailable.is_empty() {
                tracing::warn!("Skipping unavailable keys {:?}", unavailable);
            }
            return Ok(unavailable);
        }

        for key in command.keys() {
            let availability = self.evaluator.classify(key, topology, &view);
            self.evaluator.write_decision(key, &availability)?;
        }
        Ok(Vec::new())
    }

    fn owns_for_write(
        &self,
        ctx: &InvocationContext,
        topology: &CacheTopology,
        segment: u32,
    ) -> bool {
        !self.config.mode.is_distributed()
            || ctx.is_local_mode_forced()
            || topology.is_write_owner(&self.local, segment)
    }

    fn should_replicate(&self, ctx: &InvocationContext, command: &WriteCommand) -> bool {
        self.config.mode.is_clustered()
            && command.successful
            && ctx.is_origin_local()
            && !ctx.is_in_tx_scope()
            && !ctx.is_local_mode_forced()
            && (command.is_clear() || !command.keys().is_empty())
    }

    fn is_synchronous(&self, flags: &Flags) -> bool {
        if flags.contains(Flags::FORCE_SYNCHRONOUS) {
            true
        } else if flags.contains(Flags::FORCE_ASYNCHRONOUS) {
            false
        } else {
            self.config.mode.is_synchronous()
        }
    }

    fn write_recipients(&self, command: &WriteCommand, topology: &CacheTopology) -> Recipients {
        if self.config.mode.is_replicated() || command.is_clear() {
            return Recipients::All;
        }
        let keys: Vec<&str> = command.keys();
        Recipients::Only(self.owners_of(keys, topology))
    }

    /// Reachable write owners of `keys`, without the local node.
    fn owners_of<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        topology: &CacheTopology,
    ) -> Vec<Address> {
        let view = self.tracker.view();
        let partitioner = self.container.partitioner();
        let mut targets: Vec<Address> = Vec::new();
        for key in keys {
            for owner in topology.write_owners(partitioner.get_segment(key)) {
                if owner != self.local && view.contains(&owner) && !targets.contains(&owner) {
                    targets.push(owner);
                }
            }
        }
        targets
    }

    /// The answer of the first owner of the key that responded.
    fn primary_answer(
        &self,
        command: &WriteCommand,
        topology: &CacheTopology,
        responses: &ResponseMap,
    ) -> Option<ResponseValue> {
        let key = *command.keys().first()?;
        let segment = self.container.partitioner().get_segment(key);
        topology
            .write_owners(segment)
            .iter()
            .find_map(|owner| responses.get(owner).and_then(|r| r.value()).cloned())
    }

    // ============================================================
    // TRANSACTIONS
    // ============================================================

    /// Sends the prepare of `gtx` to the owners of its keys.
    ///
    /// With `one_phase_commit` configured the prepare also commits, locally included.
    pub async fn handle_prepare(
        &self,
        ctx: &InvocationContext,
        gtx: &GlobalTransactionId,
    ) -> Result<()> {
        let tx = self.transactions.local_transaction(gtx)?;
        let one_phase = self.config.one_phase_commit;
        let purely_local = tx
            .modifications
            .iter()
            .all(|write| write.flags.contains(Flags::CACHE_MODE_LOCAL));

        if !ctx.is_origin_local() || purely_local || !self.config.mode.is_clustered() {
            let topology_id = self.tracker.topology_id();
            self.transactions
                .mark_prepared(gtx, Vec::new(), one_phase, topology_id)?;
            if one_phase {
                self.commit_locally(&tx, &self.tracker.current());
            }
            return Ok(());
        }

        let mut command = RpcCommand::new(
            self.local.clone(),
            self.tracker.topology_id(),
            CommandBody::Prepare(PrepareCommand {
                gtx: gtx.clone(),
                modifications: tx.modifications.clone(),
                one_phase,
            }),
        );
        let topology = self
            .tracker
            .await_stable_topology(ctx, &command, TopologyTarget::AtLeast(command.topology_id))
            .await?;
        command.topology_id = topology.topology_id;

        let view = self.tracker.view();
        for write in &tx.modifications {
            for key in write.keys() {
                let availability = self.evaluator.classify(key, &topology, &view);
                self.evaluator.write_decision(key, &availability)?;
            }
        }

        let participants = if self.config.mode.is_replicated()
            || tx.modifications.iter().any(WriteCommand::is_clear)
        {
            view.members
                .iter()
                .filter(|member| **member != self.local)
                .cloned()
                .collect()
        } else {
            let keys = tx.modifications.iter().flat_map(|write| write.keys());
            self.owners_of(keys, &topology)
        };
        self.transactions
            .mark_prepared(gtx, participants.clone(), one_phase, topology.topology_id)?;

        if !participants.is_empty() {
            let options = if self.config.mode.is_synchronous() {
                RpcOptions::synchronous(self.config.remote_timeout)
            } else {
                RpcOptions::asynchronous(self.config.remote_timeout)
            };
            tracing::debug!("Preparing {} on {:?}", gtx, participants);
            self.transport
                .invoke_remotely(&Recipients::Only(participants), &command, options)
                .await?;
        }

        if one_phase {
            self.commit_locally(&tx, &topology);
        }
        Ok(())
    }

    /// Commits a prepared transaction on its participants, then locally.
    pub async fn handle_commit(
        &self,
        ctx: &InvocationContext,
        gtx: &GlobalTransactionId,
    ) -> Result<()> {
        let tx = self.transactions.local_transaction(gtx)?;
        if !tx.prepared {
            return Err(CacheError::UnknownTransaction(gtx.clone()));
        }
        if tx.one_phase {
            // Already committed by the prepare.
            self.transactions.remove_local(gtx);
            return Ok(());
        }
        if !ctx.is_origin_local() || !self.config.mode.is_clustered() {
            self.commit_locally(&tx, &self.tracker.current());
            return Ok(());
        }

        let issued_at = tx.prepare_topology_id.unwrap_or(0);
        let command = RpcCommand::new(
            self.local.clone(),
            issued_at,
            CommandBody::Commit(CommitCommand { gtx: gtx.clone() }),
        );

        let topology = match self.commit_rounds(ctx, &tx, &command).await {
            Ok(topology) => topology,
            Err(e) => {
                self.abandon_commit(&tx).await;
                return Err(e);
            }
        };
        self.commit_locally(&tx, &topology);
        Ok(())
    }

    /// Runs commit rounds until one goes through, returning the topology it went through on.
    async fn commit_rounds(
        &self,
        ctx: &InvocationContext,
        tx: &LocalTransaction,
        command: &RpcCommand,
    ) -> Result<Arc<CacheTopology>> {
        let gtx = &tx.gtx;
        let mut budget = RetryBudget::new(self.config.commit_retries);
        let mut target = TopologyTarget::AtLeast(command.topology_id);
        loop {
            let topology = self
                .tracker
                .await_stable_topology(ctx, command, target)
                .await?;

            match self.send_commit(tx, &topology).await {
                Attempt::Done(()) => return Ok(topology),
                Attempt::Fatal(e) => {
                    tracing::warn!("Commit of {} failed: {}", gtx, e);
                    return Err(e);
                }
                Attempt::Retry(e) => {
                    if !budget.try_consume() {
                        tracing::warn!("Commit of {} out of retries: {}", gtx, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "Commit of {} hit {}, retrying ({} left)",
                        gtx,
                        e,
                        budget.remaining()
                    );
                    target = self.resynchronize(ctx, command, &e).await?;
                }
            }
        }
    }

    /// Forgets a transaction whose commit failed and releases its prepared state on the
    /// participants. Participants that already committed ignore the rollback.
    async fn abandon_commit(&self, tx: &LocalTransaction) {
        self.transactions.remove_local(&tx.gtx);
        if tx.participants.is_empty() {
            return;
        }
        let command = RpcCommand::new(
            self.local.clone(),
            self.tracker.topology_id(),
            CommandBody::Rollback(RollbackCommand {
                gtx: tx.gtx.clone(),
            }),
        );
        let options = RpcOptions::ignore_leavers(self.config.remote_timeout);
        let recipients = Recipients::Only(tx.participants.clone());
        if let Err(e) = self
            .transport
            .invoke_remotely(&recipients, &command, options)
            .await
        {
            tracing::warn!("Rollback of abandoned {} failed: {}", tx.gtx, e);
        }
    }

    /// One commit round: commit on the surviving participants, then re-send the prepare as
    /// one-phase to every participant that lost its state and to every owner gained since the
    /// prepare.
    async fn send_commit(&self, tx: &LocalTransaction, topology: &CacheTopology) -> Attempt<()> {
        let view = self.tracker.view();
        let targets: Vec<Address> = tx
            .participants
            .iter()
            .filter(|participant| view.contains(participant) && topology.is_member(participant))
            .cloned()
            .collect();

        let mut resend = self.new_owners(tx, topology);
        if !targets.is_empty() {
            let commit = RpcCommand::new(
                self.local.clone(),
                topology.topology_id,
                CommandBody::Commit(CommitCommand {
                    gtx: tx.gtx.clone(),
                }),
            );
            let options = RpcOptions::synchronous(self.config.remote_timeout);
            let responses = match self
                .transport
                .invoke_remotely(&Recipients::Only(targets), &commit, options)
                .await
            {
                Ok(responses) => responses,
                Err(e) => return Attempt::from_error(e),
            };
            resend.extend(
                responses
                    .iter()
                    .filter(|(_, response)| response.is_resend_prepare())
                    .map(|(address, _)| address.clone()),
            );
        }
        if resend.is_empty() {
            return Attempt::Done(());
        }
        resend.sort();
        resend.dedup();

        tracing::info!("Re-sending {} as one-phase prepare to {:?}", tx.gtx, resend);
        let prepare = RpcCommand::new(
            self.local.clone(),
            topology.topology_id,
            CommandBody::Prepare(PrepareCommand {
                gtx: tx.gtx.clone(),
                modifications: tx.modifications.clone(),
                one_phase: true,
            }),
        );
        let options = RpcOptions::synchronous(self.config.remote_timeout);
        match self
            .transport
            .invoke_remotely(&Recipients::Only(resend), &prepare, options)
            .await
        {
            Ok(_) => Attempt::Done(()),
            Err(e) => Attempt::from_error(e),
        }
    }

    /// Write owners of the transaction's keys that were not owners when it was prepared.
    fn new_owners(&self, tx: &LocalTransaction, topology: &CacheTopology) -> Vec<Address> {
        let moved = tx
            .prepare_topology_id
            .is_some_and(|prepared_at| topology.topology_id > prepared_at);
        if !moved {
            return Vec::new();
        }
        let writes: Vec<&WriteCommand> = tx
            .modifications
            .iter()
            .filter(|write| !write.flags.contains(Flags::CACHE_MODE_LOCAL))
            .collect();
        if writes.is_empty() {
            return Vec::new();
        }

        let owners = if self.config.mode.is_replicated() || writes.iter().any(|w| w.is_clear()) {
            let view = self.tracker.view();
            topology
                .members
                .iter()
                .filter(|member| **member != self.local && view.contains(member))
                .cloned()
                .collect()
        } else {
            self.owners_of(writes.iter().copied().flat_map(WriteCommand::keys), topology)
        };
        owners
            .into_iter()
            .filter(|owner| !tx.participants.contains(owner))
            .collect()
    }

    /// Waits for whatever the retryable `error` says the cluster is moving towards.
    async fn resynchronize(
        &self,
        ctx: &InvocationContext,
        command: &RpcCommand,
        error: &CacheError,
    ) -> Result<TopologyTarget> {
        match error {
            CacheError::PeerSuspected { .. } => {
                let current = TopologyTarget::AtLeast(self.tracker.topology_id());
                let topology = self
                    .tracker
                    .await_stable_topology(ctx, command, current)
                    .await?;
                Ok(TopologyTarget::AtLeast(topology.topology_id))
            }
            CacheError::StateTransferInProgress { topology_id } => {
                Ok(TopologyTarget::AtLeast(*topology_id))
            }
            _ => Err(error.clone()),
        }
    }

    fn commit_locally(&self, tx: &LocalTransaction, topology: &CacheTopology) {
        let ctx = InvocationContext::local();
        for write in &tx.modifications {
            self.container
                .apply(write, |segment| self.owns_for_write(&ctx, topology, segment));
        }
        self.transactions.remove_local(&tx.gtx);
        self.transactions.mark_completed(&tx.gtx);
        tracing::debug!("Committed {} locally", tx.gtx);
    }

    /// Rolls back `gtx` on its participants. Only a remotely prepared, two-phase transaction
    /// has anything to roll back remotely.
    pub async fn handle_rollback(
        &self,
        ctx: &InvocationContext,
        gtx: &GlobalTransactionId,
    ) -> Result<()> {
        let tx = self
            .transactions
            .remove_local(gtx)
            .ok_or_else(|| CacheError::UnknownTransaction(gtx.clone()))?;
        if !ctx.is_origin_local() || !tx.prepared || tx.one_phase || tx.participants.is_empty() {
            return Ok(());
        }

        let options = if self.config.sync_rollback_phase {
            RpcOptions::ignore_leavers(self.config.remote_timeout)
        } else {
            RpcOptions::asynchronous(self.config.remote_timeout)
        };
        let command = RpcCommand::new(
            self.local.clone(),
            self.tracker.topology_id(),
            CommandBody::Rollback(RollbackCommand { gtx: gtx.clone() }),
        );
        tracing::debug!("Rolling back {} on {:?}", gtx, tx.participants);
        self.transport
            .invoke_remotely(&Recipients::Only(tx.participants), &command, options)
            .await?;
        Ok(())
    }
}
