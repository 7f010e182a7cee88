use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::membership::types::Address;

/// Maps keys onto a fixed number of segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_segments: u32,
}

impl KeyPartitioner {
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments: num_segments.max(1),
        }
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn get_segment(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.num_segments
    }
}

/// Deterministic owner assignment over a sorted member list.
///
/// The primary of segment `s` is member `s % n`. Backups start at a segment-dependent offset
/// from the primary, so every ordered (primary, backup) pair occurs for some segment once
/// there are enough segments. Owners within a segment are distinct.
pub fn assign_owners(
    members: &[Address],
    num_segments: u32,
    num_owners: usize,
) -> Vec<Vec<Address>> {
    let mut sorted: Vec<Address> = members.to_vec();
    sorted.sort();
    sorted.dedup();

    let n = sorted.len();
    if n == 0 {
        return vec![Vec::new(); num_segments as usize];
    }
    let num_owners = num_owners.clamp(1, n);

    (0..num_segments as usize)
        .map(|segment| {
            let primary = segment % n;
            let mut owners = Vec::with_capacity(num_owners);
            owners.push(sorted[primary].clone());
            if n > 1 {
                let offset = 1 + (segment / n) % (n - 1);
                for step in 0..n - 1 {
                    if owners.len() == num_owners {
                        break;
                    }
                    let idx = (primary + offset + step) % n;
                    if idx != primary {
                        owners.push(sorted[idx].clone());
                    }
                }
                // The walk above skips the primary, so it may come up one short.
                for step in 1..n {
                    if owners.len() == num_owners {
                        break;
                    }
                    let candidate = &sorted[(primary + step) % n];
                    if !owners.contains(candidate) {
                        owners.push(candidate.clone());
                    }
                }
            }
            owners
        })
        .collect()
}
