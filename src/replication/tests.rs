//! Replication Module Tests
//!
//! Runs small clusters over the in-process transport and inspects what actually crossed
//! the (simulated) network.
//!
//! ## Test Scopes
//! - **Writes**: local application first, flag propagation, which writes stay local,
//!   outdated writes.
//! - **Commit**: resend of lost prepared state, bounded retries, cleanup after a failed
//!   commit, owners gained after the prepare, waiting out a rebalance.
//! - **Configuration**: one-phase commit and rollback behaviour.

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::CacheNode;
    use crate::commands::{
        CommandBody, Flags, InvocationContext, Response, RpcCommand, WriteCommand,
    };
    use crate::config::{CacheConfig, CacheMode};
    use crate::error::CacheError;
    use crate::membership::types::Address;
    use crate::topology::{ConsistentHash, KeyPartitioner};
    use crate::transport::local::{Delivery, LocalCluster};
    use crate::transport::{Recipients, RpcOptions, Transport};

    fn config(mode: CacheMode) -> CacheConfig {
        CacheConfig {
            mode,
            num_segments: 32,
            topology_wait_timeout: Duration::from_secs(2),
            remote_timeout: Duration::from_secs(1),
            ..CacheConfig::default()
        }
    }

    /// Starts `names` on one in-process cluster and waits until all of them run the first
    /// shared view. The delivery journal is empty on return.
    async fn start(
        names: &[&str],
        config: CacheConfig,
    ) -> (Arc<LocalCluster>, Vec<Arc<CacheNode>>) {
        let cluster = LocalCluster::new();
        let nodes: Vec<Arc<CacheNode>> = names
            .iter()
            .map(|name| CacheNode::in_process(&cluster, name, config.clone()).unwrap())
            .collect();
        let members: Vec<Address> = nodes.iter().map(|node| node.address().clone()).collect();
        let view = cluster.install_view(&members);
        for node in &nodes {
            node.await_view(view.view_id).await.unwrap();
        }
        cluster.clear_deliveries();
        (cluster, nodes)
    }

    fn named(deliveries: &[Delivery], name: &str) -> Vec<Delivery> {
        deliveries
            .iter()
            .filter(|delivery| delivery.command.name() == name)
            .cloned()
            .collect()
    }

    // ============================================================
    // NON-TRANSACTIONAL WRITES
    // ============================================================

    #[tokio::test]
    async fn test_write_applied_locally_before_it_is_sent() {
        let (cluster, nodes) = start(&["a", "b", "c"], config(CacheMode::ReplSync)).await;
        let origin = nodes[0].clone();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let record = seen.clone();
        cluster.set_hook(Arc::new(move |_: &Address, command: &RpcCommand| {
            if let CommandBody::Write(_) = command.body {
                record.lock().push(origin.local_size());
            }
            None
        }));

        nodes[0].put("k", "v").await.unwrap();
        cluster.clear_hook();

        assert_eq!(*seen.lock(), vec![1, 1]);
        assert_eq!(nodes[1].get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(nodes[2].get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_flags_travel_with_the_replicated_write() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;
        let flags = Flags::SKIP_CACHE_LOAD
            | Flags::IGNORE_RETURN_VALUES
            | Flags::SKIP_REMOTE_LOOKUP
            | Flags::PUT_FOR_STATE_TRANSFER;

        nodes[0].put_with_flags("k", "v", flags).await.unwrap();

        let writes = named(&cluster.deliveries(), "put");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].to, Address::new("b"));
        match &writes[0].command.body {
            CommandBody::Write(write) => assert!(write.flags.contains(flags)),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_mode_write_stays_local() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        nodes[0]
            .put_with_flags("k", "v", Flags::CACHE_MODE_LOCAL)
            .await
            .unwrap();

        assert!(cluster.deliveries().is_empty());
        assert_eq!(nodes[0].local_size(), 1);
        assert_eq!(nodes[1].local_size(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_replicated() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        let previous = nodes[0].replace("missing", "v").await.unwrap();

        assert_eq!(previous, None);
        assert!(cluster.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_remotely_received_write_is_not_forwarded() {
        let (cluster, nodes) = start(&["a", "b", "c"], config(CacheMode::ReplSync)).await;
        let topology_id = nodes[1].topology().topology_id;

        let command = RpcCommand::new(
            Address::new("a"),
            topology_id,
            CommandBody::Write(WriteCommand::put("k", "v")),
        );
        let response = nodes[1].handler().handle(command).await;

        assert!(response.is_success());
        assert_eq!(nodes[1].local_size(), 1);
        assert!(cluster.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_transactional_write_waits_for_commit() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        assert!(cluster.deliveries().is_empty());
        assert_eq!(nodes[0].local_size(), 0);

        tx.commit().await.unwrap();
        assert_eq!(named(&cluster.deliveries(), "prepare").len(), 1);
        assert_eq!(named(&cluster.deliveries(), "commit").len(), 1);
        assert_eq!(nodes[1].get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_async_mode_does_not_wait_for_owners() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplAsync)).await;
        cluster.set_hook(Arc::new(|_: &Address, _: &RpcCommand| {
            Some(Response::Failure("unreachable".to_string()))
        }));

        // The failure is only logged by the background send.
        nodes[0].put("k", "v").await.unwrap();
        assert_eq!(nodes[0].get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_future_return_hands_back_the_replication() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        let result = nodes[0].put_async("k", "v").await.unwrap();
        let responses = result.replication.expect("replication future").wait().await;

        assert!(responses.unwrap().contains_key(&Address::new("b")));
        assert_eq!(named(&cluster.deliveries(), "put").len(), 1);
        assert_eq!(nodes[1].get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_write_is_sent_at_the_topology_it_waited_for() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;
        let installed = nodes[0].topology();
        let hash = installed.current.clone();
        let pending = installed.successor(
            installed.topology_id + 1,
            installed.view_id,
            hash.clone(),
            Some(hash.clone()),
            installed.members.clone(),
        );
        for node in &nodes {
            assert!(node.tracker().publish(pending.clone()));
        }

        let origin = nodes[0].clone();
        let put = tokio::spawn(async move { origin.put("k", "v").await });
        tokio::time::timeout(Duration::from_secs(2), async {
            while nodes[0].tracker().waiting_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stable = installed.successor(
            installed.topology_id + 2,
            installed.view_id,
            hash,
            None,
            installed.members.clone(),
        );
        for node in &nodes {
            assert!(node.tracker().publish(stable.clone()));
        }

        put.await.unwrap().unwrap();
        let writes = named(&cluster.deliveries(), "put");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].command.topology_id, installed.topology_id + 2);
    }

    #[tokio::test]
    async fn test_outdated_write_on_a_non_owner_is_refused() {
        let config = CacheConfig {
            num_owners: 1,
            ..config(CacheMode::DistSync)
        };
        let (cluster, nodes) = start(&["a", "b", "c"], config).await;
        let topology = nodes[1].topology();
        let partitioner = KeyPartitioner::new(topology.num_segments());
        let key = (0..1_000)
            .map(|i| format!("key-{i}"))
            .find(|key| !topology.is_write_owner(nodes[1].address(), partitioner.get_segment(key)))
            .expect("b does not own every segment");

        let transport = cluster.transport(Address::new("a"));
        let command = RpcCommand::new(
            Address::new("a"),
            topology.topology_id - 1,
            CommandBody::Write(WriteCommand::put(&key, "v")),
        );
        let options = RpcOptions::synchronous(Duration::from_secs(1));
        let result = transport
            .invoke_remotely(&Recipients::Only(vec![Address::new("b")]), &command, options)
            .await;

        assert_eq!(
            result,
            Err(CacheError::OutdatedTopology {
                issued: topology.topology_id - 1,
                current: topology.topology_id,
            })
        );
        // Handed back to the caller as is, never resubmitted.
        assert_eq!(named(&cluster.deliveries(), "put").len(), 1);
        assert_eq!(nodes[1].local_size(), 0);
    }

    // ============================================================
    // COMMIT
    // ============================================================

    #[tokio::test]
    async fn test_lost_prepare_is_resent_as_one_phase_to_that_node_only() {
        let (cluster, nodes) = start(&["a", "b", "c"], config(CacheMode::ReplSync)).await;
        let coordinator = nodes[0].coordinator();

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let gtx = tx.id().clone();
        let ctx = InvocationContext::local().in_transaction(gtx.clone());
        coordinator.handle_prepare(&ctx, &gtx).await.unwrap();

        assert!(nodes[1].transactions().forget_remote(&gtx));
        cluster.clear_deliveries();
        coordinator.handle_commit(&ctx, &gtx).await.unwrap();

        let deliveries = cluster.deliveries();
        assert_eq!(named(&deliveries, "commit").len(), 2);
        let resent = named(&deliveries, "prepare");
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].to, Address::new("b"));
        match &resent[0].command.body {
            CommandBody::Prepare(prepare) => assert!(prepare.one_phase),
            other => panic!("unexpected body {:?}", other),
        }

        for node in &nodes {
            assert_eq!(node.get("k").await.unwrap().as_deref(), Some("v"));
        }
    }

    #[tokio::test]
    async fn test_commit_retries_are_bounded() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;
        cluster.set_hook(Arc::new(|_: &Address, command: &RpcCommand| {
            matches!(command.body, CommandBody::Commit(_)).then_some(
                Response::StateTransferInProgress {
                    topology_id: command.topology_id,
                },
            )
        }));

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let result = tx.commit().await;

        assert!(matches!(
            result,
            Err(CacheError::StateTransferInProgress { .. })
        ));
        // One attempt plus the default three retries.
        assert_eq!(named(&cluster.deliveries(), "commit").len(), 4);
        assert_eq!(nodes[0].local_size(), 0);
        assert_eq!(nodes[0].transactions().local_count(), 0);
        assert_eq!(nodes[1].transactions().remote_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_commit_releases_the_transaction_everywhere() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;
        cluster.set_hook(Arc::new(|_: &Address, command: &RpcCommand| {
            matches!(command.body, CommandBody::Commit(_)).then_some(
                Response::StateTransferInProgress {
                    topology_id: command.topology_id,
                },
            )
        }));

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let gtx = tx.id().clone();
        assert!(tx.commit().await.is_err());

        assert_eq!(nodes[0].transactions().local_count(), 0);
        assert_eq!(nodes[1].transactions().remote_count(), 0);
        assert_eq!(named(&cluster.deliveries(), "rollback").len(), 1);
        assert!(matches!(
            nodes[0]
                .coordinator()
                .handle_rollback(&InvocationContext::local(), &gtx)
                .await,
            Err(CacheError::UnknownTransaction(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_gives_up_on_a_peer_that_stays_suspected() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;
        cluster.set_hook(Arc::new(|_: &Address, command: &RpcCommand| {
            matches!(command.body, CommandBody::Commit(_)).then_some(Response::Suspected)
        }));

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let result = tx.commit().await;

        assert_eq!(
            result,
            Err(CacheError::PeerSuspected {
                address: Address::new("b"),
            })
        );
        assert_eq!(named(&cluster.deliveries(), "commit").len(), 4);
        assert_eq!(nodes[0].transactions().local_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_survives_a_crashed_participant() {
        let (cluster, nodes) = start(&["a", "b", "c"], config(CacheMode::ReplSync)).await;

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let gtx = tx.id().clone();
        let ctx = InvocationContext::local().in_transaction(gtx.clone());
        let coordinator = nodes[0].coordinator();
        coordinator.handle_prepare(&ctx, &gtx).await.unwrap();

        cluster.crash(&Address::new("c"));
        let view = cluster.install_view(&[Address::new("a"), Address::new("b")]);
        for node in &nodes[..2] {
            node.await_view(view.view_id).await.unwrap();
        }
        cluster.clear_deliveries();

        coordinator.handle_commit(&ctx, &gtx).await.unwrap();

        let commits = named(&cluster.deliveries(), "commit");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].to, Address::new("b"));
        assert_eq!(nodes[0].get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(nodes[1].get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_commit_reaches_an_owner_gained_after_the_prepare() {
        let config = CacheConfig {
            num_owners: 1,
            ..config(CacheMode::DistSync)
        };
        let (a, b, c) = (Address::new("a"), Address::new("b"), Address::new("c"));
        let before = ConsistentHash::new(&[a.clone(), b.clone()], 32, 1);
        let after = ConsistentHash::new(&[a.clone(), b.clone(), c.clone()], 32, 1);
        let partitioner = KeyPartitioner::new(32);
        let key = (0..1_000)
            .map(|i| format!("key-{i}"))
            .find(|key| {
                let segment = partitioner.get_segment(key);
                before.locate_owners(segment) == [b.clone()]
                    && after.locate_owners(segment) == [c.clone()]
            })
            .expect("some key moves from b to c");

        let (cluster, mut nodes) = start(&["a", "b"], config.clone()).await;
        let tx = nodes[0].begin();
        tx.put(&key, "v").await.unwrap();
        let gtx = tx.id().clone();
        let ctx = InvocationContext::local().in_transaction(gtx.clone());
        nodes[0].coordinator().handle_prepare(&ctx, &gtx).await.unwrap();

        nodes.push(CacheNode::in_process(&cluster, "c", config).unwrap());
        let view = cluster.install_view(&[a, b, c.clone()]);
        for node in &nodes {
            node.await_view(view.view_id).await.unwrap();
        }

        nodes[0].coordinator().handle_commit(&ctx, &gtx).await.unwrap();

        let reprepared = named(&cluster.deliveries(), "prepare");
        assert!(reprepared.iter().any(|delivery| delivery.to == c
            && matches!(&delivery.command.body, CommandBody::Prepare(p) if p.one_phase)));
        assert_eq!(nodes[2].local_size(), 1);
        for node in &nodes {
            assert_eq!(node.get(&key).await.unwrap().as_deref(), Some("v"));
        }
    }

    #[tokio::test]
    async fn test_commit_waits_for_rebalance_to_finish() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let gtx = tx.id().clone();
        let ctx = InvocationContext::local().in_transaction(gtx.clone());
        nodes[0].coordinator().handle_prepare(&ctx, &gtx).await.unwrap();
        cluster.clear_deliveries();

        let installed = nodes[0].topology();
        let hash = installed.current.clone();
        let pending = installed.successor(
            installed.topology_id + 1,
            installed.view_id,
            hash.clone(),
            Some(hash.clone()),
            installed.members.clone(),
        );
        for node in &nodes {
            assert!(node.tracker().publish(pending.clone()));
        }

        let origin = nodes[0].clone();
        let commit = tokio::spawn(async move {
            origin.coordinator().handle_commit(&ctx, &gtx).await
        });
        tokio::time::timeout(Duration::from_secs(2), async {
            while nodes[0].tracker().waiting_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(named(&cluster.deliveries(), "commit").is_empty());

        let stable = installed.successor(
            installed.topology_id + 2,
            installed.view_id,
            hash,
            None,
            installed.members.clone(),
        );
        for node in &nodes {
            assert!(node.tracker().publish(stable.clone()));
        }

        commit.await.unwrap().unwrap();
        let commits = named(&cluster.deliveries(), "commit");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].command.topology_id, installed.topology_id + 2);
    }

    // ============================================================
    // CONFIGURATION
    // ============================================================

    #[tokio::test]
    async fn test_one_phase_commit_skips_the_commit_round() {
        let config = CacheConfig {
            one_phase_commit: true,
            ..config(CacheMode::ReplSync)
        };
        let (cluster, nodes) = start(&["a", "b"], config).await;

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        tx.commit().await.unwrap();

        let deliveries = cluster.deliveries();
        assert!(named(&deliveries, "commit").is_empty());
        let prepares = named(&deliveries, "prepare");
        assert_eq!(prepares.len(), 1);
        assert!(matches!(
            &prepares[0].command.body,
            CommandBody::Prepare(prepare) if prepare.one_phase
        ));
        assert_eq!(nodes[1].get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_rollback_of_unprepared_transaction_stays_local() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        tx.rollback().await.unwrap();

        assert!(cluster.deliveries().is_empty());
        assert_eq!(nodes[0].transactions().local_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_of_prepared_transaction_reaches_participants() {
        let (cluster, nodes) = start(&["a", "b"], config(CacheMode::ReplSync)).await;

        let tx = nodes[0].begin();
        tx.put("k", "v").await.unwrap();
        let gtx = tx.id().clone();
        let ctx = InvocationContext::local().in_transaction(gtx.clone());
        let coordinator = nodes[0].coordinator();
        coordinator.handle_prepare(&ctx, &gtx).await.unwrap();
        assert!(nodes[1].transactions().has_remote(&gtx));

        coordinator.handle_rollback(&ctx, &gtx).await.unwrap();

        assert_eq!(named(&cluster.deliveries(), "rollback").len(), 1);
        assert!(!nodes[1].transactions().has_remote(&gtx));
        assert_eq!(nodes[1].get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rollback_of_unknown_transaction_fails() {
        let (_cluster, nodes) = start(&["a"], config(CacheMode::ReplSync)).await;
        let tx = nodes[0].begin();
        let gtx = tx.id().clone();
        tx.rollback().await.unwrap();

        let again = nodes[0]
            .coordinator()
            .handle_rollback(&InvocationContext::local(), &gtx)
            .await;
        assert_eq!(again, Err(CacheError::UnknownTransaction(gtx)));
    }
}
