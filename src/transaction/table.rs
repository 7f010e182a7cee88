use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::commands::{GlobalTransactionId, WriteCommand};
use crate::error::{CacheError, Result};
use crate::membership::types::Address;

/// How long finished transactions are remembered.
const COMPLETED_RETENTION: Duration = Duration::from_secs(300);
const COMPLETED_PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
pub struct LocalTransaction {
    pub gtx: GlobalTransactionId,
    pub modifications: Vec<WriteCommand>,
    /// Nodes the prepare was sent to.
    pub participants: Vec<Address>,
    pub prepared: bool,
    pub one_phase: bool,
    pub prepare_topology_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RemoteTransaction {
    pub gtx: GlobalTransactionId,
    pub modifications: Vec<WriteCommand>,
    /// Topology the prepare was issued at.
    pub topology_id: u64,
}

pub struct TransactionTable {
    local_address: Address,
    next_id: AtomicU64,
    local: DashMap<GlobalTransactionId, LocalTransaction>,
    remote: DashMap<GlobalTransactionId, RemoteTransaction>,
    completed: DashMap<GlobalTransactionId, u64>,
}

impl TransactionTable {
    pub fn new(local_address: Address) -> Self {
        Self {
            local_address,
            next_id: AtomicU64::new(1),
            local: DashMap::new(),
            remote: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    pub fn begin(&self) -> GlobalTransactionId {
        let gtx = GlobalTransactionId {
            origin: self.local_address.clone(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        self.local.insert(
            gtx.clone(),
            LocalTransaction {
                gtx: gtx.clone(),
                modifications: Vec::new(),
                participants: Vec::new(),
                prepared: false,
                one_phase: false,
                prepare_topology_id: None,
            },
        );
        gtx
    }

    pub fn add_modification(&self, gtx: &GlobalTransactionId, write: WriteCommand) -> Result<()> {
        let mut tx = self
            .local
            .get_mut(gtx)
            .ok_or_else(|| CacheError::UnknownTransaction(gtx.clone()))?;
        tx.modifications.push(write);
        Ok(())
    }

    pub fn local_transaction(&self, gtx: &GlobalTransactionId) -> Result<LocalTransaction> {
        self.local
            .get(gtx)
            .map(|tx| tx.clone())
            .ok_or_else(|| CacheError::UnknownTransaction(gtx.clone()))
    }

    pub fn mark_prepared(
        &self,
        gtx: &GlobalTransactionId,
        participants: Vec<Address>,
        one_phase: bool,
        topology_id: u64,
    ) -> Result<()> {
        let mut tx = self
            .local
            .get_mut(gtx)
            .ok_or_else(|| CacheError::UnknownTransaction(gtx.clone()))?;
        tx.participants = participants;
        tx.prepared = true;
        tx.one_phase = one_phase;
        tx.prepare_topology_id = Some(topology_id);
        Ok(())
    }

    pub fn remove_local(&self, gtx: &GlobalTransactionId) -> Option<LocalTransaction> {
        self.local.remove(gtx).map(|(_, tx)| tx)
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn put_remote(&self, tx: RemoteTransaction) {
        self.remote.insert(tx.gtx.clone(), tx);
    }

    pub fn take_remote(&self, gtx: &GlobalTransactionId) -> Option<RemoteTransaction> {
        self.remote.remove(gtx).map(|(_, tx)| tx)
    }

    /// Drops prepared state without applying it.
    pub fn forget_remote(&self, gtx: &GlobalTransactionId) -> bool {
        self.remote.remove(gtx).is_some()
    }

    pub fn has_remote(&self, gtx: &GlobalTransactionId) -> bool {
        self.remote.contains_key(gtx)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Discards every remote transaction matching `predicate`. Returns how many were dropped.
    pub fn discard_remote_where(&self, predicate: impl Fn(&RemoteTransaction) -> bool) -> usize {
        let before = self.remote.len();
        self.remote.retain(|_, tx| !predicate(tx));
        before.saturating_sub(self.remote.len())
    }

    pub fn mark_completed(&self, gtx: &GlobalTransactionId) {
        if self.completed.len() > COMPLETED_PRUNE_THRESHOLD {
            let cutoff = now_ms().saturating_sub(COMPLETED_RETENTION.as_millis() as u64);
            self.completed.retain(|_, finished_at| *finished_at >= cutoff);
        }
        self.completed.insert(gtx.clone(), now_ms());
    }

    pub fn is_completed(&self, gtx: &GlobalTransactionId) -> bool {
        self.completed.contains_key(gtx)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
