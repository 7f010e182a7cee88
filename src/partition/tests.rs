//! Partition Handling Tests
//!
//! Builds a four-member topology, drops two members from the view and checks how each
//! policy treats keys with both, one, or no owners left.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::CacheMode;
    use crate::error::CacheError;
    use crate::membership::types::{Address, ClusterView};
    use crate::partition::{PartitionHandling, PartitionPolicyEvaluator, ReadDecision, Reachability};
    use crate::topology::{CacheTopology, ConsistentHash, KeyPartitioner};

    const SEGMENTS: u32 = 64;

    fn members() -> Vec<Address> {
        (0..4).map(|i| Address::new(format!("node-{i}"))).collect()
    }

    /// Topology after nodes 2 and 3 left with rebalancing disabled.
    fn degraded_topology() -> (CacheTopology, ClusterView) {
        let all = members();
        let survivors = vec![all[0].clone(), all[1].clone()];
        let hash = ConsistentHash::new(&all, SEGMENTS, 2).without(&all[2..]);
        let topology = CacheTopology::new(2, 2, Arc::new(hash), None, survivors.clone());
        (topology, ClusterView::new(2, survivors))
    }

    fn key_owned_by(owners: [usize; 2]) -> String {
        let all = members();
        let hash = ConsistentHash::new(&all, SEGMENTS, 2);
        let partitioner = KeyPartitioner::new(SEGMENTS);
        (0..10_000)
            .map(|i| format!("key-{i}"))
            .find(|key| {
                hash.locate_owners(partitioner.get_segment(key))
                    == [all[owners[0]].clone(), all[owners[1]].clone()]
            })
            .unwrap()
    }

    fn evaluator(policy: PartitionHandling) -> PartitionPolicyEvaluator {
        let partitioner = KeyPartitioner::new(SEGMENTS);
        PartitionPolicyEvaluator::new(policy, CacheMode::DistSync, 2, partitioner)
    }

    #[test]
    fn test_classification_after_losing_two_members() {
        let (topology, view) = degraded_topology();
        let eval = evaluator(PartitionHandling::AllowReadWrites);

        let full = eval.classify(&key_owned_by([0, 1]), &topology, &view);
        let one = eval.classify(&key_owned_by([0, 2]), &topology, &view);
        let none = eval.classify(&key_owned_by([2, 3]), &topology, &view);

        assert_eq!(full.reachability, Reachability::FullyOwned);
        assert_eq!(one.reachability, Reachability::Degraded);
        assert_eq!(one.owners, vec![Address::new("node-0")]);
        assert_eq!(none.reachability, Reachability::Unreachable);
        assert!(none.owners.is_empty());
    }

    #[test]
    fn test_allow_policies_read_degraded_and_treat_unreachable_as_absent() {
        let (topology, view) = degraded_topology();
        for policy in [PartitionHandling::AllowReads, PartitionHandling::AllowReadWrites] {
            let eval = evaluator(policy);
            let degraded = eval.classify(&key_owned_by([2, 1]), &topology, &view);
            let lost = eval.classify(&key_owned_by([2, 3]), &topology, &view);
            assert_eq!(eval.read_decision("k", &degraded), Ok(ReadDecision::Proceed));
            assert_eq!(eval.read_decision("k", &lost), Ok(ReadDecision::Absent));
        }
    }

    #[test]
    fn test_deny_refuses_degraded_reads() {
        let (topology, view) = degraded_topology();
        let eval = evaluator(PartitionHandling::DenyReadWrites);
        let degraded = eval.classify(&key_owned_by([0, 2]), &topology, &view);

        assert_eq!(
            eval.read_decision("k", &degraded),
            Err(CacheError::Unavailable {
                key: "k".to_string(),
                reachability: Reachability::Degraded
            })
        );
    }

    #[test]
    fn test_write_decisions_per_policy() {
        let (topology, view) = degraded_topology();
        let degraded_key = key_owned_by([0, 2]);
        let lost_key = key_owned_by([2, 3]);

        let allow_rw = evaluator(PartitionHandling::AllowReadWrites);
        let degraded = allow_rw.classify(&degraded_key, &topology, &view);
        let lost = allow_rw.classify(&lost_key, &topology, &view);
        assert!(allow_rw.write_decision(&degraded_key, &degraded).is_ok());
        assert!(allow_rw.write_decision(&lost_key, &lost).is_err());

        let allow_reads = evaluator(PartitionHandling::AllowReads);
        assert!(allow_reads.write_decision(&degraded_key, &degraded).is_err());
    }

    #[test]
    fn test_local_mode_is_always_fully_owned() {
        let (topology, view) = degraded_topology();
        let eval = PartitionPolicyEvaluator::new(
            PartitionHandling::DenyReadWrites,
            CacheMode::Local,
            2,
            KeyPartitioner::new(SEGMENTS),
        );
        let availability = eval.classify(&key_owned_by([2, 3]), &topology, &view);
        assert_eq!(availability.reachability, Reachability::FullyOwned);
    }
}
