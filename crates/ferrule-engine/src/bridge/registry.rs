//! Context registry
//!
//! Maps an opaque [`ContextId`] to the bridge state bundle of that context:
//! its callback registry, async work bookkeeping, threadsafe function
//! proxies, user data slot and cleanup hooks.
//!
//! The registry is an owned object, not a process-wide global. Entries are
//! created lazily and torn down atomically: the whole bundle sits behind one
//! `RwLock<Option<_>>`, so a lookup racing a teardown either holds the fully
//! valid bundle or observes `ContextGone`, never a half-cleared one.

use crate::bridge::async_work::WorkRegistry;
use crate::bridge::callback::CallbackRegistry;
use crate::bridge::tsfn::TsfnControl;
use dashmap::DashMap;
use ferrule_sdk::{BridgeError, BridgeResult, CleanupHookId, ContextId, TsfnId};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use std::any::Any;
use std::sync::Arc;

/// Opaque embedder data stored in a context's user data slot
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Hook run when its context is torn down
pub type CleanupHook = Box<dyn FnOnce() + Send>;

// ============================================================================
// LiveState
// ============================================================================

/// Bridge state of a context that has not been torn down
pub(crate) struct LiveState {
    pub callbacks: CallbackRegistry,
    pub works: WorkRegistry,
    pub tsfns: DashMap<TsfnId, Arc<dyn TsfnControl>>,
    user_data: Mutex<Option<UserData>>,
    cleanup_hooks: Mutex<Vec<(CleanupHookId, CleanupHook)>>,
}

impl LiveState {
    fn new() -> Self {
        Self {
            callbacks: CallbackRegistry::new(),
            works: WorkRegistry::new(),
            tsfns: DashMap::new(),
            user_data: Mutex::new(None),
            cleanup_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the user data slot, returning the previous value
    pub fn set_user_data(&self, data: UserData) -> Option<UserData> {
        self.user_data.lock().replace(data)
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().clone()
    }

    pub fn add_cleanup_hook(&self, hook: CleanupHook) -> CleanupHookId {
        let id = CleanupHookId::new();
        self.cleanup_hooks.lock().push((id, hook));
        id
    }

    pub fn remove_cleanup_hook(&self, id: CleanupHookId) -> bool {
        let mut hooks = self.cleanup_hooks.lock();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    /// Remove all cleanup hooks, most recently added first
    pub fn take_cleanup_hooks(&self) -> Vec<CleanupHook> {
        let hooks = std::mem::take(&mut *self.cleanup_hooks.lock());
        hooks.into_iter().rev().map(|(_, hook)| hook).collect()
    }

    /// Snapshot of the live threadsafe function proxies
    pub fn tsfn_snapshot(&self) -> Vec<Arc<dyn TsfnControl>> {
        self.tsfns.iter().map(|entry| entry.value().clone()).collect()
    }
}

// ============================================================================
// ContextEntry
// ============================================================================

/// Registry entry of one context
pub struct ContextEntry {
    id: ContextId,
    state: RwLock<Option<LiveState>>,
}

impl ContextEntry {
    fn new(id: ContextId) -> Self {
        Self {
            id,
            state: RwLock::new(Some(LiveState::new())),
        }
    }

    /// Context this entry belongs to
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether the entry has not been torn down
    pub fn is_live(&self) -> bool {
        self.state.read().is_some()
    }

    /// Borrow the live state, or fail with `ContextGone`.
    ///
    /// The guard blocks teardown while held; never keep it across a call
    /// into managed code.
    pub(crate) fn live(&self) -> BridgeResult<MappedRwLockReadGuard<'_, LiveState>> {
        RwLockReadGuard::try_map(self.state.read(), |state| state.as_ref())
            .map_err(|_| BridgeError::ContextGone(self.id))
    }

    /// Detach the live state. Returns `None` if already torn down.
    fn detach(&self) -> Option<LiveState> {
        self.state.write().take()
    }
}

impl std::fmt::Debug for ContextEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEntry")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// ContextRegistry
// ============================================================================

/// Registry of per-context bridge state
#[derive(Debug, Default)]
pub struct ContextRegistry {
    entries: DashMap<ContextId, Arc<ContextEntry>>,
}

impl ContextRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Get the entry of a context, creating it on first use.
    ///
    /// Concurrent first calls for the same context all observe one entry.
    pub fn get_or_create(&self, id: ContextId) -> Arc<ContextEntry> {
        self.entries
            .entry(id)
            .or_insert_with(|| {
                log::debug!("{}: creating registry entry", id);
                Arc::new(ContextEntry::new(id))
            })
            .clone()
    }

    /// Look up an existing entry
    pub fn lookup(&self, id: ContextId) -> BridgeResult<Arc<ContextEntry>> {
        self.entries
            .get(&id)
            .map(|entry| entry.clone())
            .filter(|entry| entry.is_live())
            .ok_or(BridgeError::ContextGone(id))
    }

    /// Tear down a context's entry.
    ///
    /// Runs the remaining cleanup hooks (most recent first), aborts any
    /// threadsafe function still registered and drops the user data slot.
    /// Aborted proxies are finalized on their host thread's next turn.
    /// Returns `false` if there was nothing to tear down.
    pub fn teardown(&self, id: ContextId) -> bool {
        let Some((_, entry)) = self.entries.remove(&id) else {
            return false;
        };
        let Some(state) = entry.detach() else {
            return false;
        };

        for hook in state.take_cleanup_hooks() {
            hook();
        }
        for tsfn in state.tsfn_snapshot() {
            tsfn.abort();
        }
        log::debug!(
            "{}: registry entry torn down ({} callbacks, {} async work items)",
            id,
            state.callbacks.len(),
            state.works.len()
        );
        true
    }

    /// Number of registered contexts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
