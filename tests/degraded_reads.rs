//! Degraded Cluster Scenarios
//!
//! Four nodes with two owners per segment lose two members while rebalancing is off.
//! Keys are picked so that both owners, only the primary, only the backup, or no owner
//! survive, and each partition handling policy is checked against them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use replicated_cache::membership::types::Address;
use replicated_cache::partition::PartitionHandling;
use replicated_cache::topology::KeyPartitioner;
use replicated_cache::transport::local::LocalCluster;
use replicated_cache::{CacheConfig, CacheError, CacheMode, CacheNode};

const SEGMENTS: u32 = 64;

struct Degraded {
    nodes: Vec<Arc<CacheNode>>,
    /// Both owners, primary only, backup only, no owner left.
    keys: [String; 4],
}

fn config(policy: PartitionHandling) -> CacheConfig {
    CacheConfig {
        mode: CacheMode::DistSync,
        num_owners: 2,
        num_segments: SEGMENTS,
        partition_handling: policy,
        topology_wait_timeout: Duration::from_secs(2),
        remote_timeout: Duration::from_secs(1),
        ..CacheConfig::default()
    }
}

/// First key whose owners are exactly `owners`, primary first.
fn key_owned_by(node: &CacheNode, owners: [&Address; 2]) -> String {
    let topology = node.topology();
    let partitioner = KeyPartitioner::new(SEGMENTS);
    (0..100_000)
        .map(|i| format!("key-{i}"))
        .find(|key| {
            let found = topology.read_owners(partitioner.get_segment(key));
            found.len() == 2 && &found[0] == owners[0] && &found[1] == owners[1]
        })
        .expect("some key maps to every owner pair")
}

/// Writes "value0".."value3", then crashes nodes 2 and 3 and installs the two-node view.
async fn degrade(policy: PartitionHandling) -> Degraded {
    let cluster = LocalCluster::new();
    let names = ["node-0", "node-1", "node-2", "node-3"];
    let nodes: Vec<Arc<CacheNode>> = names
        .iter()
        .map(|name| CacheNode::in_process(&cluster, name, config(policy)).unwrap())
        .collect();
    let all: Vec<Address> = nodes.iter().map(|node| node.address().clone()).collect();

    let view = cluster.install_view(&all);
    for node in &nodes {
        node.await_view(view.view_id).await.unwrap();
    }

    let keys = [
        key_owned_by(&nodes[0], [&all[0], &all[1]]),
        key_owned_by(&nodes[0], [&all[0], &all[2]]),
        key_owned_by(&nodes[0], [&all[2], &all[1]]),
        key_owned_by(&nodes[0], [&all[2], &all[3]]),
    ];
    for (i, key) in keys.iter().enumerate() {
        nodes[0].put(key, &format!("value{i}")).await.unwrap();
    }

    for node in &nodes {
        node.set_rebalancing_enabled(false);
    }
    cluster.crash(&all[2]);
    cluster.crash(&all[3]);
    let survivors = cluster.install_view(&all[..2]);
    for node in &nodes[..2] {
        let topology = node.await_view(survivors.view_id).await.unwrap();
        assert_eq!(topology.members, all[..2].to_vec());
    }

    Degraded { nodes, keys }
}

#[tokio::test]
async fn test_batch_read_skips_keys_without_owners() {
    let Degraded { nodes, keys } = degrade(PartitionHandling::AllowReadWrites).await;
    let batch: Vec<&str> = keys.iter().map(String::as_str).collect();

    let expected: BTreeMap<String, String> = keys[..3]
        .iter()
        .enumerate()
        .map(|(i, key)| (key.clone(), format!("value{i}")))
        .collect();

    for node in &nodes[..2] {
        let found = node.get_all(&batch).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found, expected);
    }
}

#[tokio::test]
async fn test_single_reads_on_survivors() {
    let Degraded { nodes, keys } = degrade(PartitionHandling::AllowReadWrites).await;

    for node in &nodes[..2] {
        for (i, key) in keys[..3].iter().enumerate() {
            let value = node.get(key).await.unwrap();
            assert_eq!(value, Some(format!("value{i}")));
        }
        assert_eq!(node.get(&keys[3]).await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_batch_write_reports_keys_without_owners() {
    let Degraded { nodes, keys } = degrade(PartitionHandling::AllowReadWrites).await;
    let batch: BTreeMap<String, String> = keys
        .iter()
        .map(|key| (key.clone(), "updated".to_string()))
        .collect();

    let outcome = nodes[1].put_all(batch).await.unwrap();
    assert_eq!(outcome.unavailable, vec![keys[3].clone()]);

    for key in &keys[..3] {
        assert_eq!(nodes[0].get(key).await.unwrap().as_deref(), Some("updated"));
    }
    assert!(matches!(
        nodes[0].put(&keys[3], "lost").await,
        Err(CacheError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn test_allow_reads_refuses_degraded_writes() {
    let Degraded { nodes, keys } = degrade(PartitionHandling::AllowReads).await;

    assert_eq!(nodes[0].get(&keys[1]).await.unwrap().as_deref(), Some("value1"));
    assert!(matches!(
        nodes[0].put(&keys[1], "new").await,
        Err(CacheError::Unavailable { .. })
    ));
    nodes[0].put(&keys[0], "new").await.unwrap();
    assert_eq!(nodes[1].get(&keys[0]).await.unwrap().as_deref(), Some("new"));
}

#[tokio::test]
async fn test_deny_read_writes_refuses_degraded_reads() {
    let Degraded { nodes, keys } = degrade(PartitionHandling::DenyReadWrites).await;

    assert_eq!(nodes[1].get(&keys[0]).await.unwrap().as_deref(), Some("value0"));
    for key in &keys[1..] {
        assert!(matches!(
            nodes[1].get(key).await,
            Err(CacheError::Unavailable { .. })
        ));
    }
}
