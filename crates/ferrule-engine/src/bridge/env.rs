//! The host-thread environment
//!
//! An [`Env`] is one context as seen from its host thread: the lazily
//! created registry entry, the heap, the scope stack, the reference table,
//! the pending exception and the run loop. It is `!Send`, so everything
//! that touches host values is confined to the thread that created it.

use crate::bridge::async_work::Completion;
use crate::bridge::registry::{CleanupHook, ContextEntry, ContextRegistry, LiveState, UserData};
use crate::bridge::reference::ReferenceTable;
use crate::bridge::scope::{Handle, ScopeStack};
use crate::bridge::tsfn::TsfnControl;
use crate::config::BridgeOptions;
use crate::host::heap::{GcStats, Heap, ObjectId, Value};
use crate::host::reactor::{HostJob, LoopHandle, Reactor};
use ferrule_sdk::{BridgeError, BridgeResult, CleanupHookId, ContextId, TsfnId, WorkId};
use once_cell::unsync::OnceCell;
use parking_lot::MappedRwLockReadGuard;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One context, bound to its host thread
pub struct Env {
    id: ContextId,
    registry: Arc<ContextRegistry>,
    entry: OnceCell<Arc<ContextEntry>>,
    pub(crate) heap: RefCell<Heap>,
    pub(crate) scopes: RefCell<ScopeStack>,
    pub(crate) references: RefCell<ReferenceTable>,
    pub(crate) completions: RefCell<FxHashMap<WorkId, Completion>>,
    pub(crate) tsfn_hosts: RefCell<FxHashMap<TsfnId, Box<dyn Any>>>,
    // Kept apart from the registry entry, which may be torn down first
    pub(crate) tsfn_controls: RefCell<FxHashMap<TsfnId, Arc<dyn TsfnControl>>>,
    pub(crate) reactor: RefCell<Reactor>,
    exception: RefCell<Option<Value>>,
    uncaught: RefCell<Vec<String>>,
    torn_down: Cell<bool>,
    _host_thread: PhantomData<*const ()>,
}

impl Env {
    /// Create a context with its own registry
    pub fn new(options: BridgeOptions) -> Self {
        Self::with_registry(&Arc::new(ContextRegistry::new()), options)
    }

    /// Create a context whose entry lives in a shared registry
    pub fn with_registry(registry: &Arc<ContextRegistry>, options: BridgeOptions) -> Self {
        let id = ContextId::new();
        log::debug!(
            "{}: starting host with {} worker thread(s)",
            id,
            options.worker_threads
        );
        Self {
            id,
            registry: registry.clone(),
            entry: OnceCell::new(),
            heap: RefCell::new(Heap::new()),
            scopes: RefCell::new(ScopeStack::new()),
            references: RefCell::new(ReferenceTable::new()),
            completions: RefCell::new(FxHashMap::default()),
            tsfn_hosts: RefCell::new(FxHashMap::default()),
            tsfn_controls: RefCell::new(FxHashMap::default()),
            reactor: RefCell::new(Reactor::start(id, &options)),
            exception: RefCell::new(None),
            uncaught: RefCell::new(Vec::new()),
            torn_down: Cell::new(false),
            _host_thread: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(BridgeOptions::default().worker_threads(2))
    }

    /// Context identifier
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Registry holding this context's entry
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Registry entry, created on first use
    pub(crate) fn entry(&self) -> &Arc<ContextEntry> {
        self.entry.get_or_init(|| self.registry.get_or_create(self.id))
    }

    /// Live bridge state, or `ContextGone`
    pub(crate) fn live(&self) -> BridgeResult<MappedRwLockReadGuard<'_, LiveState>> {
        self.entry().live()
    }

    pub(crate) fn ensure_live(&self) -> BridgeResult<()> {
        self.live().map(drop)
    }

    /// Thread-safe handle to this context's run loop
    pub fn loop_handle(&self) -> LoopHandle {
        self.reactor.borrow().handle().clone()
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Run every re-entry job that is ready, without waiting. Returns the
    /// number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.reactor.borrow().try_next();
            let Some(job) = job else {
                return ran;
            };
            self.dispatch(job);
            ran += 1;
        }
    }

    /// Wait up to `timeout` for one job and run it
    pub fn run_once(&self, timeout: Duration) -> bool {
        let job = self.reactor.borrow().next_timeout(timeout);
        match job {
            Some(job) => {
                self.dispatch(job);
                true
            }
            None => false,
        }
    }

    /// Run jobs until `done` holds or `timeout` expires. Returns whether
    /// `done` held.
    pub fn run_until(&self, mut done: impl FnMut(&Env) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let poll = self.reactor.borrow().poll_interval();
        loop {
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.run_once((deadline - now).min(poll)) {
                self.run_until_idle();
            }
        }
    }

    /// Run until nothing keeps the loop alive and no job is pending.
    /// Returns the number of jobs run.
    pub fn run_loop(&self) -> usize {
        let handle = self.loop_handle();
        let poll = self.reactor.borrow().poll_interval();
        let mut ran = 0;
        loop {
            ran += self.run_until_idle();
            if handle.active_handles() == 0 && self.pending_jobs() == 0 {
                return ran;
            }
            if self.run_once(poll) {
                ran += 1;
            }
        }
    }

    /// Re-entry jobs waiting for the host thread
    pub fn pending_jobs(&self) -> usize {
        self.reactor.borrow().pending_jobs()
    }

    fn dispatch(&self, job: HostJob) {
        self.run_in_scope(|env| job(env));
        self.report_uncaught();
    }

    /// Run host-side code in a fresh scope, the way a re-entry does.
    /// A failure, or an exception left pending, is reported as uncaught.
    pub(crate) fn reenter(&self, f: impl FnOnce(&Env) -> BridgeResult<()>) {
        self.run_in_scope(|env| {
            if let Err(err) = f(env) {
                env.throw_bridge_error(err);
            }
        });
        self.report_uncaught();
    }

    fn report_uncaught(&self) {
        let Some(exception) = self.exception.borrow_mut().take() else {
            return;
        };
        let message = self.describe(&exception);
        log::error!("{}: uncaught exception: {}", self.id, message);
        self.uncaught.borrow_mut().push(message);
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    /// Raise `value` as the pending exception
    pub fn throw(&self, value: Handle) -> BridgeResult<()> {
        if self.is_exception_pending() {
            return Err(BridgeError::PendingException);
        }
        let value = self.value(value);
        *self.exception.borrow_mut() = Some(value);
        Ok(())
    }

    /// Raise a new error object
    pub fn throw_error(&self, code: Option<&str>, message: &str) -> BridgeResult<()> {
        if self.is_exception_pending() {
            return Err(BridgeError::PendingException);
        }
        let error = self.new_error(code, message);
        *self.exception.borrow_mut() = Some(error);
        Ok(())
    }

    /// Translate a bridge failure into a pending host exception. An
    /// exception already pending wins.
    pub(crate) fn throw_bridge_error(&self, err: BridgeError) {
        if self.is_exception_pending() {
            return;
        }
        let error = self.new_error(err.code(), &err.to_string());
        *self.exception.borrow_mut() = Some(error);
    }

    pub fn is_exception_pending(&self) -> bool {
        self.exception.borrow().is_some()
    }

    /// Take the pending exception, if any
    pub fn get_and_clear_last_exception(&self) -> Option<Handle> {
        let exception = self.exception.borrow_mut().take();
        exception.map(|value| self.handle(value))
    }

    /// Exceptions that escaped re-entry jobs since the last call, oldest
    /// first
    pub fn take_uncaught_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.uncaught.borrow_mut())
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Run a host collection and the finalizers of everything reclaimed
    pub fn collect_garbage(&self) -> GcStats {
        let roots: Vec<ObjectId> = {
            let scopes = self.scopes.borrow();
            let references = self.references.borrow();
            let exception = self.exception.borrow();
            scopes
                .roots()
                .chain(references.roots())
                .chain(exception.as_ref().and_then(Value::as_object))
                .collect()
        };

        let pending = self.heap.borrow_mut().collect(roots);
        let stats = self.heap.borrow().stats();
        log::debug!(
            "{}: collection freed {} object(s), {} live, {} finalizer(s) pending",
            self.id,
            stats.last_freed,
            stats.live_objects,
            pending.len()
        );
        for finalizer in pending {
            self.run_in_scope(|env| finalizer.run(env));
        }
        stats
    }

    /// Statistics of the last collection
    pub fn gc_stats(&self) -> GcStats {
        self.heap.borrow().stats()
    }

    /// Objects currently on the heap
    pub fn live_objects(&self) -> usize {
        self.heap.borrow().live_objects()
    }

    // ========================================================================
    // Instance data and cleanup hooks
    // ========================================================================

    /// Store embedder data in the context's slot, returning what it
    /// replaced. The slot holds a reference, not a copy.
    pub fn set_instance_data<T: Any + Send + Sync>(
        &self,
        data: Arc<T>,
    ) -> BridgeResult<Option<UserData>> {
        Ok(self.live()?.set_user_data(data))
    }

    /// Embedder data, if set and of type `T`
    pub fn get_instance_data<T: Any + Send + Sync>(&self) -> BridgeResult<Option<Arc<T>>> {
        let data = self.live()?.user_data();
        Ok(data.and_then(|data| data.downcast::<T>().ok()))
    }

    /// Run `hook` when the context is torn down. Hooks run most recent
    /// first.
    pub fn add_cleanup_hook<F>(&self, hook: F) -> BridgeResult<CleanupHookId>
    where
        F: FnOnce() + Send + 'static,
    {
        let hook: CleanupHook = Box::new(hook);
        Ok(self.live()?.add_cleanup_hook(hook))
    }

    /// Unregister a cleanup hook. Returns `false` if it was not registered.
    pub fn remove_cleanup_hook(&self, id: CleanupHookId) -> BridgeResult<bool> {
        Ok(self.live()?.remove_cleanup_hook(id))
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear the context down.
    ///
    /// Order: cleanup hooks, threadsafe functions (aborted and finalized),
    /// heap finalizers, the registry entry, then the worker pool. Queued
    /// completions that never reached the host thread are dropped.
    pub fn teardown(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        log::debug!("{}: tearing down", self.id);

        if let Some(entry) = self.entry.get() {
            let hooks = entry
                .live()
                .map(|live| live.take_cleanup_hooks())
                .unwrap_or_default();
            for hook in hooks {
                hook();
            }
        }

        let tsfns: Vec<_> = self.tsfn_controls.borrow().values().cloned().collect();
        for tsfn in tsfns {
            tsfn.clone().abort();
            tsfn.finalize(self);
        }

        self.exception.borrow_mut().take();
        let pending = self.heap.borrow_mut().drain();
        for finalizer in pending {
            self.run_in_scope(|env| finalizer.run(env));
        }
        self.report_uncaught();

        if let Some(entry) = self.entry.get() {
            if let Ok(live) = entry.live() {
                let outstanding = live.works.outstanding();
                if !outstanding.is_empty() {
                    log::warn!(
                        "{}: tearing down with async work in flight: {}",
                        self.id,
                        outstanding.join(", ")
                    );
                }
            }
            self.registry.teardown(self.id);
        }

        self.reactor.borrow_mut().shutdown();
        self.completions.borrow_mut().clear();
        self.tsfn_hosts.borrow_mut().clear();
        self.tsfn_controls.borrow_mut().clear();
        log::debug!("{}: torn down", self.id);
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.id)
            .field("scope_depth", &self.scope_depth())
            .field("torn_down", &self.torn_down.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_entry_is_lazy() {
        let registry = Arc::new(ContextRegistry::new());
        let env = Env::with_registry(&registry, BridgeOptions::default().worker_threads(1));
        assert!(registry.is_empty());

        env.set_instance_data(Arc::new(1u8)).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(env.id()).is_ok());

        let id = env.id();
        env.teardown();
        assert_eq!(registry.lookup(id).unwrap_err(), BridgeError::ContextGone(id));
    }

    #[test]
    fn test_instance_data() {
        let env = Env::for_tests();
        assert!(env.get_instance_data::<String>().unwrap().is_none());

        let data = Arc::new(String::from("state"));
        assert!(env.set_instance_data(data.clone()).unwrap().is_none());
        assert_eq!(
            env.get_instance_data::<String>().unwrap().as_deref(),
            Some(&String::from("state"))
        );
        assert!(env.get_instance_data::<u32>().unwrap().is_none());
        assert!(env.set_instance_data(Arc::new(2u32)).unwrap().is_some());

        env.teardown();
        assert_eq!(Arc::strong_count(&data), 1);
    }

    #[test]
    fn test_cleanup_hooks_run_before_finalizers() {
        let env = Env::for_tests();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        env.add_cleanup_hook(move || log.lock().unwrap().push("hook")).unwrap();
        let log = order.clone();
        env.run_in_scope(|env| {
            let obj = env.create_object();
            let log = log.clone();
            env.add_finalizer(obj, move |_env| log.lock().unwrap().push("finalizer"))
                .unwrap();
            // keep it reachable until teardown
            let global = env.global();
            env.set_named_property(global, "kept", obj).unwrap();
        });

        env.teardown();
        assert_eq!(*order.lock().unwrap(), vec!["hook", "finalizer"]);
    }

    #[test]
    fn test_removed_hook_skipped() {
        let env = Env::for_tests();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let id = env
            .add_cleanup_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(env.remove_cleanup_hook(id).unwrap());
        drop(env);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_throw_and_clear() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            env.throw_error(Some("E_TEST"), "bad").unwrap();
            assert!(env.is_exception_pending());
            assert_eq!(env.throw_error(None, "again"), Err(BridgeError::PendingException));

            let exception = env.get_and_clear_last_exception().unwrap();
            assert!(env.is_error(exception));
            let code = env.get_named_property(exception, "code").unwrap();
            assert_eq!(env.get_value_string(code).unwrap(), "E_TEST");
            assert!(!env.is_exception_pending());
            assert!(env.get_and_clear_last_exception().is_none());
        });
    }

    #[test]
    fn test_uncaught_in_job_is_recorded() {
        let env = Env::for_tests();
        env.loop_handle()
            .post(Box::new(|env: &Env| {
                let value = env.create_string("thrown");
                env.throw(value).unwrap();
            }))
            .unwrap();
        assert_eq!(env.run_until_idle(), 1);
        assert!(!env.is_exception_pending());
        assert_eq!(env.take_uncaught_errors(), vec!["thrown".to_string()]);
        assert!(env.take_uncaught_errors().is_empty());
    }

    #[test]
    fn test_pending_exception_is_a_root() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let err = env.create_error(None, "kept alive");
            env.throw(err).unwrap();
        });
        env.collect_garbage();
        env.run_in_scope(|env| {
            let exception = env.get_and_clear_last_exception().unwrap();
            let message = env.get_named_property(exception, "message").unwrap();
            assert_eq!(env.get_value_string(message).unwrap(), "kept alive");
        });
    }

    #[test]
    fn test_run_loop_exits_when_idle() {
        let env = Env::for_tests();
        assert_eq!(env.run_loop(), 0);

        let handle = env.loop_handle();
        handle.post(Box::new(|_env: &Env| {})).unwrap();
        handle.post(Box::new(|_env: &Env| {})).unwrap();
        assert_eq!(env.run_loop(), 2);
    }

    #[test]
    fn test_run_until_times_out() {
        let env = Env::for_tests();
        assert!(!env.run_until(|_| false, Duration::from_millis(30)));
        assert!(env.run_until(|_| true, Duration::from_millis(0)));
    }
}
