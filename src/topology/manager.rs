use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, watch};

use super::state_transfer::StateTransfer;
use super::tracker::TopologyTracker;
use super::types::{CacheTopology, ConsistentHash};
use crate::config::CacheConfig;
use crate::membership::types::{Address, ClusterView};
use crate::storage::DataContainer;
use crate::transaction::TransactionTable;

/// Topology ids are derived from the view they belong to, so nodes that install the same
/// view also agree on the ids they publish for it.
const IDS_PER_VIEW: u64 = 3;

fn topology_id(view_id: u64, phase: u64) -> u64 {
    view_id * IDS_PER_VIEW + phase
}

const PHASE_VIEW: u64 = 0;
const PHASE_PENDING: u64 = 1;
const PHASE_STABLE: u64 = 2;

/// The single writer of the topology tracker.
///
/// Reacts to view changes by pruning leavers from the ownership and, when rebalancing is
/// enabled, moving to a balanced ownership over the new members with a state transfer in
/// between.
pub struct TopologyManager {
    local: Address,
    config: CacheConfig,
    tracker: Arc<TopologyTracker>,
    state_transfer: StateTransfer,
    container: Arc<DataContainer>,
    transactions: Arc<TransactionTable>,
    rebalancing_enabled: AtomicBool,
    trigger: Notify,
    update_lock: Mutex<()>,
}

impl TopologyManager {
    pub fn new(
        local: Address,
        config: CacheConfig,
        tracker: Arc<TopologyTracker>,
        state_transfer: StateTransfer,
        container: Arc<DataContainer>,
        transactions: Arc<TransactionTable>,
    ) -> Arc<Self> {
        let rebalancing_enabled = AtomicBool::new(config.rebalancing_enabled);
        Arc::new(Self {
            local,
            config,
            tracker,
            state_transfer,
            container,
            transactions,
            rebalancing_enabled,
            trigger: Notify::new(),
            update_lock: Mutex::new(()),
        })
    }

    pub fn is_rebalancing_enabled(&self) -> bool {
        self.rebalancing_enabled.load(Ordering::SeqCst)
    }

    /// Turning rebalancing back on immediately checks whether the ownership is balanced.
    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        let previous = self.rebalancing_enabled.swap(enabled, Ordering::SeqCst);
        tracing::info!("Rebalancing {}", if enabled { "enabled" } else { "disabled" });
        if enabled && !previous {
            self.trigger.notify_one();
        }
    }

    pub async fn run(self: Arc<Self>, mut views: watch::Receiver<Arc<ClusterView>>) {
        let initial = views.borrow_and_update().clone();
        self.handle_view(initial).await;

        loop {
            tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        tracing::info!("View stream closed, topology manager stopping");
                        break;
                    }
                    let view = views.borrow_and_update().clone();
                    self.handle_view(view).await;
                }
                _ = self.trigger.notified() => {
                    let _guard = self.update_lock.lock().await;
                    self.rebalance().await;
                }
            }
        }
    }

    pub async fn handle_view(&self, view: Arc<ClusterView>) {
        let _guard = self.update_lock.lock().await;
        if !self.tracker.install_view(view.clone()) {
            return;
        }

        let current = self.tracker.current();
        let leavers: Vec<Address> = current
            .current
            .members()
            .iter()
            .chain(current.members.iter())
            .filter(|member| !view.contains(member))
            .cloned()
            .collect();
        if !leavers.is_empty() {
            tracing::info!("Members left view {}: {:?}", view.view_id, leavers);
        }

        let pruned = Arc::new(current.current.without(&leavers));
        if self.is_rebalancing_enabled() {
            let balanced = Arc::new(self.balanced_hash(&view.members));
            if balanced != pruned {
                self.rebalance_to(&current, pruned, balanced, &view).await;
                return;
            }
        }

        let next = current.successor(
            topology_id(view.view_id, PHASE_VIEW),
            view.view_id,
            pruned,
            None,
            view.members.clone(),
        );
        if self.tracker.publish(next) {
            tracing::info!(
                "Topology {} installed for view {} {:?}",
                self.tracker.topology_id(),
                view.view_id,
                view.members
            );
        }
    }

    fn balanced_hash(&self, members: &[Address]) -> ConsistentHash {
        if self.config.mode.is_replicated() || !self.config.mode.is_clustered() {
            ConsistentHash::replicated(members, self.config.num_segments)
        } else {
            ConsistentHash::new(members, self.config.num_segments, self.config.num_owners)
        }
    }

    /// Rebalances the installed topology if its ownership is not the balanced one.
    async fn rebalance(&self) {
        if !self.is_rebalancing_enabled() {
            return;
        }
        let current = self.tracker.current();
        let view = self.tracker.view();
        let balanced = Arc::new(self.balanced_hash(&view.members));
        if balanced != current.current {
            self.rebalance_to(&current, current.current.clone(), balanced, &view)
                .await;
        }
    }

    /// Publishes `from` with `to` pending, transfers state, then publishes `to` alone.
    /// Callers hold `update_lock`.
    async fn rebalance_to(
        &self,
        installed: &CacheTopology,
        from: Arc<ConsistentHash>,
        to: Arc<ConsistentHash>,
        view: &ClusterView,
    ) {
        tracing::info!(
            "Rebalancing {} segment(s) over {:?}",
            to.num_segments(),
            view.members
        );
        let pending = installed.successor(
            topology_id(view.view_id, PHASE_PENDING),
            view.view_id,
            from,
            Some(to.clone()),
            view.members.clone(),
        );
        if !self.tracker.publish(pending) {
            return;
        }

        let pending = self.tracker.current();
        self.state_transfer.fetch_new_segments(&pending, view).await;

        let stable = pending.successor(
            topology_id(view.view_id, PHASE_STABLE),
            view.view_id,
            to,
            None,
            view.members.clone(),
        );
        if self.tracker.publish(stable) {
            let topology = self.tracker.current();
            tracing::info!(
                "Topology {} installed for view {} after rebalance",
                topology.topology_id,
                view.view_id
            );
            self.after_stable(&topology).await;
        }
    }

    /// Drops data for segments this node no longer owns, once the other members have moved
    /// past the rebalance and cannot ask for them anymore. Transactions prepared before the
    /// rebalance that touch such segments are dropped too; their commit asks for a resend.
    async fn after_stable(&self, topology: &CacheTopology) {
        if !self.config.mode.is_distributed() {
            return;
        }
        let timeout = self.config.topology_wait_timeout + self.config.remote_timeout;
        self.state_transfer.confirm_installed(topology, timeout).await;

        let owned = topology.current.segments_owned_by(&self.local);
        let removed = self.container.retain_segments(&owned);
        let partitioner = *self.container.partitioner();
        let discarded = self.transactions.discard_remote_where(|tx| {
            tx.topology_id < topology.topology_id
                && tx.modifications.iter().any(|write| {
                    write
                        .keys()
                        .iter()
                        .any(|key| !owned.contains(&partitioner.get_segment(key)))
                })
        });
        tracing::info!(
            "Topology {} stable: dropped {} entries and {} prepared transaction(s)",
            topology.topology_id,
            removed,
            discarded
        );
    }
}
