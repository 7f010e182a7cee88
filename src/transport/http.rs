use async_trait::async_trait;
use axum::{Json, extract::Extension};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;

use super::{
    CommandHandler, Recipients, ResponseMode, RpcOptions, Transport, collect_responses,
    resolve_recipients,
};
use crate::commands::{Response, ResponseMap, RpcCommand};
use crate::error::{CacheError, Result};
use crate::membership::service::MembershipService;
use crate::membership::types::{Address, ClusterView};

/// Internal endpoint every node serves for inter-node commands.
pub const ENDPOINT_RPC: &str = "/internal/rpc";

/// JSON over HTTP, with targets resolved through the gossip membership.
///
/// A target that cannot be resolved or refuses the connection is reported as `Suspected`:
/// from the caller's point of view it has left the cluster.
#[derive(Clone)]
pub struct HttpTransport {
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(membership: Arc<MembershipService>) -> Self {
        Self {
            membership,
            http_client: reqwest::Client::new(),
        }
    }

    async fn send_checked(
        &self,
        target: Address,
        command: &RpcCommand,
        view: &ClusterView,
        options: RpcOptions,
    ) -> (Address, Result<Response>) {
        if !view.contains(&target) {
            return (target, Ok(Response::Suspected));
        }
        let Some(node) = self.membership.get_member(&target) else {
            return (target, Ok(Response::Suspected));
        };
        let url = format!("http://{}{}", node.http_addr, ENDPOINT_RPC);

        let sent = self
            .http_client
            .post(url)
            .json(command)
            .timeout(options.timeout)
            .send()
            .await;

        let outcome = match sent {
            Ok(resp) => match resp.json::<Response>().await {
                Ok(response) => Ok(response),
                Err(e) => Err(CacheError::Transport(format!(
                    "invalid response from {target}: {e}"
                ))),
            },
            Err(e) if e.is_timeout() => Err(CacheError::RemoteTimeout {
                address: target.clone(),
                timeout: options.timeout,
            }),
            Err(e) if e.is_connect() => {
                tracing::warn!("Cannot reach {}: {}", target, e);
                Ok(Response::Suspected)
            }
            Err(e) => Err(CacheError::Transport(e.to_string())),
        };
        (target, outcome)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn local_address(&self) -> &Address {
        &self.membership.local_node.address
    }

    fn view(&self) -> Arc<ClusterView> {
        self.membership.current_view()
    }

    fn subscribe_views(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.membership.subscribe_views()
    }

    async fn invoke_remotely(
        &self,
        recipients: &Recipients,
        command: &RpcCommand,
        options: RpcOptions,
    ) -> Result<ResponseMap> {
        let view = self.view();
        let local = self.local_address().clone();
        let targets = resolve_recipients(recipients, &view, &local);

        if options.mode == ResponseMode::Asynchronous {
            let transport = self.clone();
            let command = command.clone();
            tokio::spawn(async move {
                let sends = targets
                    .into_iter()
                    .map(|target| transport.send_checked(target, &command, &view, options));
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
            .map(|target| self.send_checked(target, command, &view, options));
        let outcomes = join_all(sends).await;
        collect_responses(options.mode, command.topology_id, outcomes)
    }
}

/// Serves [`ENDPOINT_RPC`].
pub async fn handle_rpc(
    Extension(handler): Extension<Arc<dyn CommandHandler>>,
    Json(command): Json<RpcCommand>,
) -> Json<Response> {
    tracing::debug!(
        "Received {} from {} (topology {})",
        command.name(),
        command.origin,
        command.topology_id
    );
    Json(handler.handle(command).await)
}
