//! Opaque identifiers that cross the bridge boundary
//!
//! Identifiers are the only datum that travels between the host and the
//! managed side. Closures, work items and proxies stay in their registries
//! and are looked up by ID.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Generate a new unique ID
            pub fn new() -> Self {
                $name($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Get the numeric ID value
            pub fn as_u64(self) -> u64 {
                self.0
            }

            /// Create an ID from a raw u64 value
            pub fn from_u64(id: u64) -> Self {
                $name(id)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifies one instance of the host execution engine
    ContextId,
    NEXT_CONTEXT_ID,
    "context"
);

define_id!(
    /// Key of a managed closure in a context's callback registry
    CallbackId,
    NEXT_CALLBACK_ID,
    "callback"
);

define_id!(
    /// Key of an explicit refcounted reference
    ReferenceId,
    NEXT_REFERENCE_ID,
    "reference"
);

define_id!(
    /// Key of an async work item
    WorkId,
    NEXT_WORK_ID,
    "work"
);

define_id!(
    /// Key of a threadsafe function proxy
    TsfnId,
    NEXT_TSFN_ID,
    "tsfn"
);

define_id!(
    /// Key of an environment cleanup hook
    CleanupHookId,
    NEXT_CLEANUP_HOOK_ID,
    "cleanup-hook"
);
