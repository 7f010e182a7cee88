use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::flags::Flags;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WriteKind {
    Put {
        key: String,
        value: String,
    },
    PutAll {
        entries: BTreeMap<String, String>,
    },
    Remove {
        key: String,
    },
    /// Replaces an existing mapping; with `expected` set, only if the current value matches.
    Replace {
        key: String,
        expected: Option<String>,
        value: String,
    },
    Clear,
}

/// A non-transactional mutation, or one modification of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteCommand {
    pub kind: WriteKind,
    pub flags: Flags,
    /// Set by the node that applied the command. Unsuccessful writes are never replicated.
    pub successful: bool,
}

impl WriteCommand {
    pub fn new(kind: WriteKind) -> Self {
        Self {
            kind,
            flags: Flags::empty(),
            successful: false,
        }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(WriteKind::Put {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn put_all(entries: BTreeMap<String, String>) -> Self {
        Self::new(WriteKind::PutAll { entries })
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(WriteKind::Remove { key: key.into() })
    }

    pub fn replace(
        key: impl Into<String>,
        expected: Option<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(WriteKind::Replace {
            key: key.into(),
            expected,
            value: value.into(),
        })
    }

    pub fn clear() -> Self {
        Self::new(WriteKind::Clear)
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            WriteKind::Put { .. } => "put",
            WriteKind::PutAll { .. } => "put_all",
            WriteKind::Remove { .. } => "remove",
            WriteKind::Replace { .. } => "replace",
            WriteKind::Clear => "clear",
        }
    }

    /// Keys touched by this write. Empty for `Clear`, which touches every key.
    pub fn keys(&self) -> Vec<&str> {
        match &self.kind {
            WriteKind::Put { key, .. }
            | WriteKind::Remove { key }
            | WriteKind::Replace { key, .. } => vec![key.as_str()],
            WriteKind::PutAll { entries } => entries.keys().map(String::as_str).collect(),
            WriteKind::Clear => Vec::new(),
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self.kind, WriteKind::Clear)
    }

    /// Keeps only the entries whose key satisfies `keep`. Returns the dropped keys.
    ///
    /// Single-key writes are left untouched; callers decide per key for those.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let WriteKind::PutAll { entries } = &mut self.kind else {
            return Vec::new();
        };
        let dropped: Vec<String> = entries
            .keys()
            .filter(|key| !keep(key))
            .cloned()
            .collect();
        for key in &dropped {
            entries.remove(key);
        }
        dropped
    }
}
