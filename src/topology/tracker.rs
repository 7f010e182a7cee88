use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use super::types::{CacheTopology, ConsistentHash};
use crate::commands::{InvocationContext, RpcCommand};
use crate::error::{CacheError, Result};
use crate::membership::types::{Address, ClusterView};

/// Which topology a waiter needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyTarget {
    /// Any topology with an id of at least this value.
    AtLeast(u64),
    /// Whatever comes after the topology installed when the wait starts.
    Next,
}

impl fmt::Display for TopologyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyTarget::AtLeast(id) => write!(f, "topology >= {id}"),
            TopologyTarget::Next => f.write_str("next topology"),
        }
    }
}

/// Holds the installed topology and lets callers wait for later ones.
///
/// Readers take a lock-free snapshot with [`TopologyTracker::current`]. Publishing is
/// serialized and wakes every waiter through a watch channel carrying the installed id.
/// Waiters subscribe before they look at the snapshot, so a publish that happens between
/// the check and the wait is never missed.
pub struct TopologyTracker {
    current: ArcSwap<CacheTopology>,
    view: ArcSwap<ClusterView>,
    publish_lock: parking_lot::Mutex<()>,
    published: watch::Sender<u64>,
    waiters: AtomicUsize,
    wait_timeout: Duration,
}

impl TopologyTracker {
    /// Starts at topology 0: a single-member view where the local node owns everything.
    pub fn new(local: Address, num_segments: u32, wait_timeout: Duration) -> Self {
        let view = ClusterView::singleton(local);
        let hash = Arc::new(ConsistentHash::new(&view.members, num_segments, 1));
        let topology = CacheTopology::new(0, view.view_id, hash, None, view.members.clone());
        let (published, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(topology),
            view: ArcSwap::from_pointee(view),
            publish_lock: parking_lot::Mutex::new(()),
            published,
            waiters: AtomicUsize::new(0),
            wait_timeout,
        }
    }

    pub fn current(&self) -> Arc<CacheTopology> {
        self.current.load_full()
    }

    pub fn topology_id(&self) -> u64 {
        self.current.load().topology_id
    }

    pub fn view(&self) -> Arc<ClusterView> {
        self.view.load_full()
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Records a newer cluster view. Views that are not strictly newer are ignored.
    pub fn install_view(&self, view: Arc<ClusterView>) -> bool {
        let _guard = self.publish_lock.lock();
        if view.view_id <= self.view.load().view_id {
            return false;
        }
        self.view.store(view);
        self.published.send_modify(|_| {});
        true
    }

    /// Installs `topology` if its id is strictly greater than the installed one.
    pub fn publish(&self, topology: CacheTopology) -> bool {
        let _guard = self.publish_lock.lock();
        let installed = self.current.load().topology_id;
        if topology.topology_id <= installed {
            tracing::warn!(
                "Ignoring topology {} (installed {})",
                topology.topology_id,
                installed
            );
            return false;
        }
        let id = topology.topology_id;
        tracing::debug!(
            "Installing topology {} (rebalancing={})",
            id,
            topology.is_rebalancing()
        );
        self.current.store(Arc::new(topology));
        self.published.send_replace(id);
        true
    }

    /// Number of callers currently blocked in one of the `await_*` methods.
    pub fn waiting_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Waits until the installed topology satisfies `target`.
    pub async fn await_topology(
        &self,
        ctx: &InvocationContext,
        command: &RpcCommand,
        target: TopologyTarget,
    ) -> Result<Arc<CacheTopology>> {
        let min_id = self.resolve(target);
        tracing::trace!(
            "{} {} ({:?}) waiting for {}",
            command.name(),
            command.origin,
            ctx.origin,
            target
        );
        self.wait_until(target.to_string(), move |topology, _| {
            topology.topology_id >= min_id
        })
        .await
    }

    /// Waits for a topology satisfying `target` that has no rebalance in flight.
    pub async fn await_stable_topology(
        &self,
        ctx: &InvocationContext,
        command: &RpcCommand,
        target: TopologyTarget,
    ) -> Result<Arc<CacheTopology>> {
        let min_id = self.resolve(target);
        tracing::trace!(
            "{} ({:?}) waiting for stable {}",
            command.name(),
            ctx.origin,
            target
        );
        self.wait_until(format!("stable {target}"), move |topology, _| {
            topology.topology_id >= min_id && !topology.is_rebalancing()
        })
        .await
    }

    /// Waits until `member` is gone from both the view and the installed topology.
    pub async fn await_member_left(
        &self,
        ctx: &InvocationContext,
        command: &RpcCommand,
        member: &Address,
    ) -> Result<Arc<CacheTopology>> {
        tracing::debug!(
            "{} ({:?}) waiting for {} to leave",
            command.name(),
            ctx.origin,
            member
        );
        let member = member.clone();
        let description = format!("{member} to leave the view");
        self.wait_until(description, move |topology, view| {
            !view.contains(&member) && !topology.is_member(&member)
        })
        .await
    }

    /// Waits for a stable topology derived from view `view_id` or later.
    pub async fn await_view(&self, view_id: u64) -> Result<Arc<CacheTopology>> {
        self.wait_until(format!("stable topology for view {view_id}"), move |topology, _| {
            topology.view_id >= view_id && !topology.is_rebalancing()
        })
        .await
    }

    fn resolve(&self, target: TopologyTarget) -> u64 {
        match target {
            TopologyTarget::AtLeast(id) => id,
            TopologyTarget::Next => self.topology_id() + 1,
        }
    }

    async fn wait_until<F>(
        &self,
        description: String,
        predicate: F,
    ) -> Result<Arc<CacheTopology>>
    where
        F: Fn(&CacheTopology, &ClusterView) -> bool + Send + Sync,
    {
        let mut updates = self.published.subscribe();
        let _waiter = WaiterGuard::new(&self.waiters);

        let wait = async {
            loop {
                let topology = self.current();
                if predicate(&topology, &self.view()) {
                    return Ok(topology);
                }
                if updates.changed().await.is_err() {
                    return Err(CacheError::Transport("topology tracker closed".to_string()));
                }
            }
        };

        match tokio::time::timeout(self.wait_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::TopologyWaitTimeout {
                target: description,
                current: self.topology_id(),
                timeout: self.wait_timeout,
            }),
        }
    }
}

/// Keeps the waiter count accurate even when the waiting future is dropped.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
