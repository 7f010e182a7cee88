use super::flags::Flags;
use super::tx::GlobalTransactionId;
use crate::membership::types::Address;

/// Where an invocation entered the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(Address),
}

/// Per-invocation state that is not part of the command itself.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub origin: Origin,
    pub flags: Flags,
    /// Set when the invocation runs inside an open transaction.
    pub transaction: Option<GlobalTransactionId>,
    /// The caller wants a future for the replication instead of waiting for it.
    pub use_future_return: bool,
}

impl InvocationContext {
    pub fn local() -> Self {
        Self {
            origin: Origin::Local,
            flags: Flags::empty(),
            transaction: None,
            use_future_return: false,
        }
    }

    pub fn remote(from: Address) -> Self {
        Self {
            origin: Origin::Remote(from),
            ..Self::local()
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn in_transaction(mut self, gtx: GlobalTransactionId) -> Self {
        self.transaction = Some(gtx);
        self
    }

    pub fn with_future_return(mut self) -> Self {
        self.use_future_return = true;
        self
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn is_in_tx_scope(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn is_local_mode_forced(&self) -> bool {
        self.flags.contains(Flags::CACHE_MODE_LOCAL)
    }
}
