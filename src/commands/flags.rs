use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Per-invocation markers. They are copied verbatim onto replicated commands so the
    /// remote application observes the same semantics as the local one.
    #[derive(Copy, Debug, Default, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct Flags: u32 {
        /// Apply on this node only; never replicate.
        const CACHE_MODE_LOCAL       = 1 << 0;
        /// Do not consult a cache loader for the previous value.
        const SKIP_CACHE_LOAD        = 1 << 1;
        const SKIP_LOCKING           = 1 << 2;
        /// Replicate synchronously regardless of the cache mode.
        const FORCE_SYNCHRONOUS      = 1 << 3;
        /// Replicate asynchronously regardless of the cache mode.
        const FORCE_ASYNCHRONOUS     = 1 << 4;
        /// The caller does not need the previous value.
        const IGNORE_RETURN_VALUES   = 1 << 5;
        // Not interpreted by this node; carried verbatim for the receiver.
        const SKIP_REMOTE_LOOKUP     = 1 << 6;
        const PUT_FOR_STATE_TRANSFER = 1 << 7;
    }
}
