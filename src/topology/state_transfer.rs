use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use super::types::CacheTopology;
use crate::commands::{CommandBody, ResponseValue, RpcCommand, StateRequestCommand};
use crate::membership::types::{Address, ClusterView};
use crate::storage::DataContainer;
use crate::transport::{Recipients, RpcOptions, Transport};

/// Pulls the segments this node is about to own from the nodes that hold them.
pub struct StateTransfer {
    local: Address,
    transport: Arc<dyn Transport>,
    container: Arc<DataContainer>,
    timeout: Duration,
}

impl StateTransfer {
    pub fn new(
        local: Address,
        transport: Arc<dyn Transport>,
        container: Arc<DataContainer>,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            container,
            timeout,
        }
    }

    /// Fetches every segment the pending ownership of `topology` gives to this node and the
    /// current ownership does not. Returns the number of entries inserted.
    ///
    /// A node whose current ownership was never shared with anyone (it only knows itself)
    /// asks every other member, since its own view of the previous owners is meaningless.
    /// Unreachable sources are skipped; those segments start empty.
    pub async fn fetch_new_segments(&self, topology: &CacheTopology, view: &ClusterView) -> usize {
        let Some(pending) = &topology.pending else {
            return 0;
        };
        let joining = topology.current.members() == std::slice::from_ref(&self.local);

        let mut requests: BTreeMap<Address, Vec<u32>> = BTreeMap::new();
        let mut broadcast: Vec<u32> = Vec::new();
        for segment in pending.segments_owned_by(&self.local) {
            if joining {
                broadcast.push(segment);
                continue;
            }
            if topology.current.is_owner(&self.local, segment) {
                continue;
            }
            let source = topology
                .current
                .locate_owners(segment)
                .iter()
                .find(|owner| **owner != self.local && view.contains(owner));
            if let Some(source) = source {
                requests.entry(source.clone()).or_default().push(segment);
            }
        }

        let mut inserted = 0;
        if !broadcast.is_empty() {
            let others: Vec<Address> = view
                .members
                .iter()
                .filter(|member| **member != self.local)
                .cloned()
                .collect();
            inserted += self.request(topology, others, broadcast).await;
        }
        for (source, segments) in requests {
            inserted += self.request(topology, vec![source], segments).await;
        }

        tracing::info!(
            "State transfer for topology {} inserted {} entries",
            topology.topology_id,
            inserted
        );
        inserted
    }

    /// Waits until every other member has installed `topology` or a later one, so none of
    /// them still needs entries from this node for it. Returns `false` when a member did
    /// not confirm within `timeout`.
    pub async fn confirm_installed(&self, topology: &CacheTopology, timeout: Duration) -> bool {
        let command = RpcCommand::new(
            self.local.clone(),
            topology.topology_id,
            CommandBody::ConfirmTopology,
        );
        match self
            .transport
            .invoke_remotely(&Recipients::All, &command, RpcOptions::ignore_leavers(timeout))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    "Members did not confirm topology {}: {}",
                    topology.topology_id,
                    e
                );
                false
            }
        }
    }

    async fn request(
        &self,
        topology: &CacheTopology,
        sources: Vec<Address>,
        segments: Vec<u32>,
    ) -> usize {
        if sources.is_empty() {
            return 0;
        }
        let requested: BTreeSet<u32> = segments.iter().copied().collect();
        let command = RpcCommand::new(
            self.local.clone(),
            topology.topology_id,
            CommandBody::StateRequest(StateRequestCommand { segments }),
        );
        let responses = match self
            .transport
            .invoke_remotely(
                &Recipients::Only(sources.clone()),
                &command,
                RpcOptions::ignore_leavers(self.timeout),
            )
            .await
        {
            Ok(responses) => responses,
            Err(e) => {
                tracing::warn!("State request to {:?} failed: {}", sources, e);
                return 0;
            }
        };

        let mut inserted = 0;
        for response in responses.into_values() {
            let Some(ResponseValue::Entries(entries)) = response.value() else {
                continue;
            };
            for entry in entries {
                if requested.contains(&entry.segment)
                    && self
                        .container
                        .put_if_absent(entry.key.clone(), entry.value.clone())
                {
                    inserted += 1;
                }
            }
        }
        inserted
    }
}
