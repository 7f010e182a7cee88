use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

use crate::commands::{ResponseValue, StateEntry, WriteCommand, WriteKind};
use crate::topology::KeyPartitioner;

/// Result of applying one write to the local container.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub successful: bool,
    /// Keys actually touched on this node.
    pub applied_keys: Vec<String>,
    pub value: ResponseValue,
}

/// Node-local entries, grouped by segment so ownership changes can move whole segments.
pub struct DataContainer {
    segments: DashMap<u32, DashMap<String, String>>,
    partitioner: KeyPartitioner,
}

impl DataContainer {
    pub fn new(partitioner: KeyPartitioner) -> Self {
        Self {
            segments: DashMap::new(),
            partitioner,
        }
    }

    pub fn partitioner(&self) -> &KeyPartitioner {
        &self.partitioner
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let segment = self.partitioner.get_segment(key);
        self.segments
            .get(&segment)
            .and_then(|entries| entries.get(key).map(|value| value.clone()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn put(&self, key: String, value: String) -> Option<String> {
        let segment = self.partitioner.get_segment(&key);
        self.segments.entry(segment).or_default().insert(key, value)
    }

    /// Inserts only if the key is absent. Used by state transfer so a value written during
    /// the transfer is never overwritten by an older copy.
    pub fn put_if_absent(&self, key: String, value: String) -> bool {
        let segment = self.partitioner.get_segment(&key);
        let entries = self.segments.entry(segment).or_default();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, value);
        true
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        let segment = self.partitioner.get_segment(key);
        self.segments
            .get(&segment)
            .and_then(|entries| entries.remove(key).map(|(_, value)| value))
    }

    pub fn clear(&self) {
        self.segments.clear();
    }

    pub fn dump_segment(&self, segment: u32) -> Vec<StateEntry> {
        self.segments
            .get(&segment)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| StateEntry {
                        segment,
                        key: entry.key().clone(),
                        value: entry.value().clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_segment(&self, segment: u32) -> bool {
        self.segments
            .get(&segment)
            .is_some_and(|entries| !entries.is_empty())
    }

    pub fn segment_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .count()
    }

    pub fn entry_count(&self) -> usize {
        self.segments.iter().map(|entry| entry.value().len()).sum()
    }

    /// Drops every segment not in `keep`. Returns how many entries were removed.
    pub fn retain_segments(&self, keep: &BTreeSet<u32>) -> usize {
        let mut removed = 0;
        self.segments.retain(|segment, entries| {
            if keep.contains(segment) {
                true
            } else {
                removed += entries.len();
                false
            }
        });
        removed
    }

    /// Applies `command` to the keys whose segment satisfies `owns`.
    ///
    /// `Clear` always applies. A remove of an absent key and a replace whose condition does
    /// not hold are unsuccessful.
    pub fn apply(&self, command: &WriteCommand, owns: impl Fn(u32) -> bool) -> ApplyOutcome {
        let owned = |key: &str| owns(self.partitioner.get_segment(key));

        match &command.kind {
            WriteKind::Put { key, value } => {
                if !owned(key) {
                    return ApplyOutcome::skipped();
                }
                let previous = self.put(key.clone(), value.clone());
                ApplyOutcome::applied(vec![key.clone()], ResponseValue::Value(previous))
            }
            WriteKind::PutAll { entries } => {
                let mut previous = BTreeMap::new();
                let mut applied_keys = Vec::new();
                for (key, value) in entries {
                    if !owned(key) {
                        continue;
                    }
                    if let Some(old) = self.put(key.clone(), value.clone()) {
                        previous.insert(key.clone(), old);
                    }
                    applied_keys.push(key.clone());
                }
                ApplyOutcome::applied(applied_keys, ResponseValue::Values(previous))
            }
            WriteKind::Remove { key } => {
                if !owned(key) {
                    return ApplyOutcome::skipped();
                }
                match self.remove(key) {
                    Some(previous) => ApplyOutcome::applied(
                        vec![key.clone()],
                        ResponseValue::Value(Some(previous)),
                    ),
                    None => ApplyOutcome::failed(ResponseValue::Value(None)),
                }
            }
            WriteKind::Replace {
                key,
                expected,
                value,
            } => {
                if !owned(key) {
                    return ApplyOutcome::skipped();
                }
                let segment = self.partitioner.get_segment(key);
                let Some(entries) = self.segments.get(&segment) else {
                    return ApplyOutcome::failed(ResponseValue::Value(None));
                };
                let Some(mut current) = entries.get_mut(key) else {
                    return ApplyOutcome::failed(ResponseValue::Value(None));
                };
                if let Some(expected) = expected
                    && *current != *expected
                {
                    let seen = current.clone();
                    return ApplyOutcome::failed(ResponseValue::Value(Some(seen)));
                }
                let previous = std::mem::replace(&mut *current, value.clone());
                ApplyOutcome::applied(vec![key.clone()], ResponseValue::Value(Some(previous)))
            }
            WriteKind::Clear => {
                self.clear();
                ApplyOutcome::applied(Vec::new(), ResponseValue::Void)
            }
        }
    }
}

impl ApplyOutcome {
    fn applied(applied_keys: Vec<String>, value: ResponseValue) -> Self {
        Self {
            successful: true,
            applied_keys,
            value,
        }
    }

    fn failed(value: ResponseValue) -> Self {
        Self {
            successful: false,
            applied_keys: Vec::new(),
            value,
        }
    }

    /// Nothing to do on this node; still counts as successful so the write can replicate
    /// to the owners.
    fn skipped() -> Self {
        Self {
            successful: true,
            applied_keys: Vec::new(),
            value: ResponseValue::Value(None),
        }
    }
}
