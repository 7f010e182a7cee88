use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use super::{
    CommandHandler, Recipients, ResponseMode, RpcOptions, Transport, collect_responses,
    resolve_recipients,
};
use crate::commands::{Response, ResponseMap, RpcCommand};
use crate::error::{CacheError, Result};
use crate::membership::types::{Address, ClusterView};

/// Fault injection point: returning `Some` answers the command without delivering it.
pub type DeliveryHook = Arc<dyn Fn(&Address, &RpcCommand) -> Option<Response> + Send + Sync>;

/// One command as seen by the in-process network.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: Address,
    pub to: Address,
    pub command: RpcCommand,
}

/// An in-process cluster: nodes register a handler and talk through [`LocalTransport`].
///
/// Each node has its own view channel, so a crashed node keeps its last view while the
/// survivors move on, as a partitioned node would.
pub struct LocalCluster {
    handlers: DashMap<Address, Arc<dyn CommandHandler>>,
    views: DashMap<Address, watch::Sender<Arc<ClusterView>>>,
    next_view_id: AtomicU64,
    hook: RwLock<Option<DeliveryHook>>,
    journal: Mutex<Vec<Delivery>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            views: DashMap::new(),
            next_view_id: AtomicU64::new(1),
            hook: RwLock::new(None),
            journal: Mutex::new(Vec::new()),
        })
    }

    /// Creates the transport for `address`. Until a view is installed the node sees only
    /// itself.
    pub fn transport(self: &Arc<Self>, address: Address) -> LocalTransport {
        let views = self
            .views
            .entry(address.clone())
            .or_insert_with(|| {
                let initial = ClusterView::singleton(address.clone());
                watch::channel(Arc::new(initial)).0
            })
            .clone();
        LocalTransport {
            cluster: self.clone(),
            local: address,
            views,
        }
    }

    pub fn register(&self, address: Address, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(address, handler);
    }

    /// Stops delivering to `address`. Its view is left untouched.
    pub fn crash(&self, address: &Address) {
        self.handlers.remove(address);
        self.views.remove(address);
        tracing::info!("Simulated crash of {}", address);
    }

    /// Installs a new view on every listed member.
    pub fn install_view(&self, members: &[Address]) -> Arc<ClusterView> {
        let view_id = self.next_view_id.fetch_add(1, Ordering::SeqCst);
        let view = Arc::new(ClusterView::new(view_id, members.iter().cloned()));
        for member in members {
            if let Some(sender) = self.views.get(member) {
                sender.send_replace(view.clone());
            }
        }
        tracing::info!("Installed view {} {:?}", view_id, view.members);
        view
    }

    pub fn set_hook(&self, hook: DeliveryHook) {
        *self.hook.write() = Some(hook);
    }

    pub fn clear_hook(&self) {
        *self.hook.write() = None;
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.journal.lock().clone()
    }

    pub fn clear_deliveries(&self) {
        self.journal.lock().clear();
    }

    async fn deliver(&self, from: &Address, to: &Address, command: &RpcCommand) -> Response {
        self.journal.lock().push(Delivery {
            from: from.clone(),
            to: to.clone(),
            command: command.clone(),
        });

        let hook = self.hook.read().clone();
        if let Some(hook) = hook
            && let Some(response) = hook(to, command)
        {
            return response;
        }

        let handler = match self.handlers.get(to) {
            Some(handler) => handler.value().clone(),
            None => return Response::Suspected,
        };
        handler.handle(command.clone()).await
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    cluster: Arc<LocalCluster>,
    local: Address,
    views: watch::Sender<Arc<ClusterView>>,
}

impl LocalTransport {
    pub fn cluster(&self) -> &Arc<LocalCluster> {
        &self.cluster
    }

    async fn send_one(
        &self,
        target: Address,
        command: &RpcCommand,
        view: &ClusterView,
        options: RpcOptions,
    ) -> (Address, Result<Response>) {
        if !view.contains(&target) {
            return (target, Ok(Response::Suspected));
        }
        let delivery = self.cluster.deliver(&self.local, &target, command);
        match tokio::time::timeout(options.timeout, delivery).await {
            Ok(response) => (target, Ok(response)),
            Err(_) => {
                let error = CacheError::RemoteTimeout {
                    address: target.clone(),
                    timeout: options.timeout,
                };
                (target, Err(error))
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_address(&self) -> &Address {
        &self.local
    }

    fn view(&self) -> Arc<ClusterView> {
        self.views.borrow().clone()
    }

    fn subscribe_views(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.views.subscribe()
    }

    async fn invoke_remotely(
        &self,
        recipients: &Recipients,
        command: &RpcCommand,
        options: RpcOptions,
    ) -> Result<ResponseMap> {
        let view = self.view();
        let targets = resolve_recipients(recipients, &view, &self.local);
        tracing::debug!(
            "{} sending {} (topology {}) to {:?}",
            self.local,
            command.name(),
            command.topology_id,
            targets
        );

        if options.mode == ResponseMode::Asynchronous {
            let transport = self.clone();
            let command = command.clone();
            tokio::spawn(async move {
                let sends = targets
                    .into_iter()
                    .map(|target| transport.send_one(target, &command, &view, options));
                for (target, outcome) in join_all(sends).await {
                    if !matches!(outcome, Ok(Response::Success(_))) {
                        tracing::warn!("Asynchronous {} to {} failed", command.name(), target);
                    }
                }
            });
            return Ok(ResponseMap::new());
        }

        let sends = targets
            .into_iter()
            .map(|target| self.send_one(target, command, &view, options));
        let outcomes = join_all(sends).await;
        collect_responses(options.mode, command.topology_id, outcomes)
    }
}
