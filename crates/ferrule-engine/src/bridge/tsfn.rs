//! Threadsafe function proxy
//!
//! A [`ThreadsafeFunction`] lets any thread enqueue values that are handed
//! to a host-side callback on the host thread, in enqueue order. The queue
//! is a crossbeam channel (bounded, or unbounded for a max size of 0); the
//! host thread drains it from a re-entry job, one scope per item.
//!
//! Two independent controls guard the proxy:
//! - the acquisition count, which gates teardown: the proxy is finalized
//!   once every owner has released it and the queue has drained, or at
//!   once on abort
//! - the ref flag, which decides whether the run loop stays alive on the
//!   proxy's account
//!
//! A proxy may be bound to a host function object. The function is held
//! by a strong reference until finalization and is handed to the callback
//! on every dispatch; without a callback it is called with no arguments.
//!
//! The callback and finalizer never leave the host thread; worker threads
//! only ever touch the queue and the counters.

use crate::bridge::{Env, Handle, Reference};
use crate::host::reactor::LoopHandle;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use ferrule_sdk::{BridgeError, BridgeResult, CallMode, ContextId, ReleaseMode, TsfnId, ValueType};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Optional data attached to a threadsafe function, readable from any thread
pub type TsfnContext = Arc<dyn Any + Send + Sync>;

type TsfnCallback<T> = Box<dyn FnMut(&Env, Option<Handle>, T) -> BridgeResult<()>>;
type TsfnFinalizer = Box<dyn FnOnce(&Env)>;

/// Type-erased control surface used by the context registry at teardown
pub(crate) trait TsfnControl: Send + Sync {
    fn id(&self) -> TsfnId;

    /// Reject further calls, discard queued invocations and schedule the
    /// host-thread finalization. Any thread.
    fn abort(self: Arc<Self>);

    /// Tear the proxy down and run its finalizer. Host thread only.
    fn finalize(&self, env: &Env);
}

/// Host-thread half of a proxy, stored in the owning `Env`
struct HostSide<T> {
    callback: TsfnCallback<T>,
    function: Option<Reference>,
    finalizer: Option<TsfnFinalizer>,
}

#[derive(Debug)]
struct TsfnState {
    thread_count: usize,
    closing: bool,
    aborted: bool,
    // Calls admitted before closing that have not finished enqueueing
    entering: usize,
}

struct TsfnShared<T> {
    id: TsfnId,
    name: String,
    context_id: ContextId,
    queue_tx: Sender<T>,
    queue_rx: Receiver<T>,
    state: Mutex<TsfnState>,
    // Dropped to wake callers blocked on a full queue
    abort_tx: Mutex<Option<Sender<()>>>,
    abort_rx: Receiver<()>,
    dispatch_scheduled: AtomicBool,
    referenced: AtomicBool,
    finalized: AtomicBool,
    loop_handle: LoopHandle,
    context: Option<TsfnContext>,
}

impl<T: Send + 'static> TsfnShared<T> {
    fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    fn discard_queued(&self) -> usize {
        self.queue_rx.try_iter().count()
    }

    /// Mark the proxy aborted and drop whatever is queued
    fn abort_queue(&self) {
        {
            let mut state = self.state.lock();
            state.aborted = true;
            state.closing = true;
        }
        self.abort_tx.lock().take();
        let discarded = self.discard_queued();
        log::debug!(
            "{}: aborted {} ({}), {} queued call(s) discarded",
            self.context_id,
            self.id,
            self.name,
            discarded
        );
    }

    fn enqueue(&self, value: T, mode: CallMode) -> BridgeResult<()> {
        match mode {
            CallMode::NonBlocking => match self.queue_tx.try_send(value) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(BridgeError::QueueFull),
                Err(TrySendError::Disconnected(_)) => Err(BridgeError::Closing),
            },
            CallMode::Blocking => {
                let sent = channel::select! {
                    send(self.queue_tx, value) -> res => res.is_ok(),
                    recv(self.abort_rx) -> _ => false,
                };
                if sent {
                    Ok(())
                } else {
                    Err(BridgeError::Closing)
                }
            }
        }
    }

    fn schedule_dispatch(self: &Arc<Self>) {
        if self.dispatch_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.clone();
        let posted = self
            .loop_handle
            .post(Box::new(move |env: &Env| shared.dispatch(env)));
        if posted.is_err() {
            self.dispatch_scheduled.store(false, Ordering::Release);
            log::warn!(
                "{}: cannot dispatch {} ({}), context is gone",
                self.context_id,
                self.id,
                self.name
            );
        }
    }

    /// Drain the queue on the host thread
    fn dispatch(self: &Arc<Self>, env: &Env) {
        self.dispatch_scheduled.store(false, Ordering::Release);
        if self.finalized.load(Ordering::Acquire) {
            return;
        }

        // Absent while an outer dispatch of this proxy is running; the
        // outer one picks up whatever is queued.
        let host = env.tsfn_hosts.borrow_mut().remove(&self.id);
        let Some(mut host) = host.and_then(|host| host.downcast::<HostSide<T>>().ok()) else {
            return;
        };

        // Only what is queued now; later items get their own dispatch
        let budget = self.queue_rx.len();
        let HostSide {
            callback,
            function,
            ..
        } = &mut *host;
        for _ in 0..budget {
            if self.is_aborted() {
                break;
            }
            let Ok(value) = self.queue_rx.try_recv() else {
                break;
            };
            log::trace!("{}: dispatching {} ({})", self.context_id, self.id, self.name);
            env.reenter(|env| {
                let func = function.as_ref().and_then(|r| env.get_reference_value(r));
                callback(env, func, value)
            });
        }
        env.tsfn_hosts.borrow_mut().insert(self.id, host);

        let state = self.state.lock();
        let (closing, aborted, entering) = (state.closing, state.aborted, state.entering);
        drop(state);

        if aborted {
            self.discard_queued();
        } else if !self.queue_rx.is_empty() {
            self.schedule_dispatch();
            return;
        }
        // A call still entering schedules another dispatch once it is done
        if closing && (aborted || entering == 0) {
            self.finalize(env);
        }
    }
}

impl<T: Send + 'static> TsfnControl for TsfnShared<T> {
    fn id(&self) -> TsfnId {
        self.id
    }

    fn abort(self: Arc<Self>) {
        self.abort_queue();
        self.schedule_dispatch();
    }

    fn finalize(&self, env: &Env) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.lock().closing = true;
        self.abort_tx.lock().take();
        self.discard_queued();
        if self.referenced.swap(false, Ordering::AcqRel) {
            self.loop_handle.unhold();
        }
        if let Ok(live) = env.live() {
            live.tsfns.remove(&self.id);
        }
        env.tsfn_controls.borrow_mut().remove(&self.id);

        let host = env.tsfn_hosts.borrow_mut().remove(&self.id);
        let Some(host) = host.and_then(|host| host.downcast::<HostSide<T>>().ok()) else {
            log::debug!("{}: finalized {} ({})", self.context_id, self.id, self.name);
            return;
        };
        let HostSide {
            function,
            finalizer,
            ..
        } = *host;
        if let Some(function) = function {
            env.delete_reference(function);
        }
        if let Some(finalizer) = finalizer {
            env.reenter(|env| {
                finalizer(env);
                Ok(())
            });
        }
        log::debug!("{}: finalized {} ({})", self.context_id, self.id, self.name);
    }
}

// ============================================================================
// ThreadsafeFunction
// ============================================================================

/// Thread-safe proxy invoking a host-side callback on the host thread
pub struct ThreadsafeFunction<T: Send + 'static> {
    shared: Arc<TsfnShared<T>>,
}

impl<T: Send + 'static> Clone for ThreadsafeFunction<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> ThreadsafeFunction<T> {
    /// Registry key of this proxy
    pub fn id(&self) -> TsfnId {
        self.shared.id
    }

    /// Enqueue `value` for the callback.
    ///
    /// When the queue is full, `NonBlocking` fails with `QueueFull` and
    /// `Blocking` suspends the calling thread until space frees or the
    /// proxy closes. Never call `Blocking` from the host thread on a full
    /// queue: only the host thread drains it.
    pub fn call(&self, value: T, mode: CallMode) -> BridgeResult<()> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            if state.closing {
                return Err(BridgeError::Closing);
            }
            state.entering += 1;
        }

        let sent = shared.enqueue(value, mode);
        let (closing, aborted) = {
            let mut state = shared.state.lock();
            state.entering -= 1;
            (state.closing, state.aborted)
        };

        // An abort racing the send wins; whatever got through is dropped
        if aborted {
            shared.discard_queued();
            return Err(BridgeError::Closing);
        }
        // A release racing the send waits for this dispatch to finalize
        if sent.is_ok() || closing {
            shared.schedule_dispatch();
        }
        sent
    }

    /// Register one more owner. Fails with `Closing` once the proxy is
    /// closing.
    pub fn acquire(&self) -> BridgeResult<()> {
        let mut state = self.shared.state.lock();
        if state.closing {
            return Err(BridgeError::Closing);
        }
        state.thread_count += 1;
        Ok(())
    }

    /// Give up one owner's claim.
    ///
    /// `Release` lets queued calls drain before teardown; `Abort` discards
    /// them and rejects further calls immediately. Fails with
    /// `AlreadyFinal` once the count is zero.
    pub fn release(&self, mode: ReleaseMode) -> BridgeResult<()> {
        let closing = {
            let mut state = self.shared.state.lock();
            if state.thread_count == 0 {
                return Err(BridgeError::AlreadyFinal);
            }
            state.thread_count -= 1;
            if state.thread_count == 0 {
                state.closing = true;
            }
            state.closing
        };

        if mode == ReleaseMode::Abort {
            self.shared.abort_queue();
        }
        if closing || mode == ReleaseMode::Abort {
            self.shared.schedule_dispatch();
        }
        Ok(())
    }

    /// Keep the run loop alive on this proxy's account
    pub fn refer(&self, env: &Env) -> BridgeResult<()> {
        self.check_context(env)?;
        if !self.shared.finalized.load(Ordering::Acquire)
            && !self.shared.referenced.swap(true, Ordering::AcqRel)
        {
            self.shared.loop_handle.hold();
        }
        Ok(())
    }

    /// Stop keeping the run loop alive on this proxy's account
    pub fn unref(&self, env: &Env) -> BridgeResult<()> {
        self.check_context(env)?;
        if self.shared.referenced.swap(false, Ordering::AcqRel) {
            self.shared.loop_handle.unhold();
        }
        Ok(())
    }

    fn check_context(&self, env: &Env) -> BridgeResult<()> {
        if env.id() == self.shared.context_id {
            Ok(())
        } else {
            Err(BridgeError::InvalidArg(format!(
                "{} belongs to {}",
                self.shared.id, self.shared.context_id
            )))
        }
    }

    /// Whether the proxy keeps the run loop alive
    pub fn is_referenced(&self) -> bool {
        self.shared.referenced.load(Ordering::Acquire)
    }

    /// Current acquisition count
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().thread_count
    }

    /// Whether calls are being rejected
    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    /// Whether the proxy has been torn down
    pub fn is_finalized(&self) -> bool {
        self.shared.finalized.load(Ordering::Acquire)
    }

    /// Calls waiting for the host thread
    pub fn queued(&self) -> usize {
        self.shared.queue_rx.len()
    }

    /// Attached context data, if it has type `C`
    pub fn context<C: Any + Send + Sync>(&self) -> Option<Arc<C>> {
        self.shared.context.clone()?.downcast::<C>().ok()
    }
}

impl<T: Send + 'static> std::fmt::Debug for ThreadsafeFunction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsafeFunction")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &*self.shared.state.lock())
            .field("queued", &self.queued())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ThreadsafeFunction`]
pub struct ThreadsafeFunctionBuilder<T: Send + 'static> {
    name: String,
    max_queue_size: usize,
    initial_thread_count: usize,
    context: Option<TsfnContext>,
    callback: TsfnCallback<T>,
    function: Option<Handle>,
    finalizer: Option<TsfnFinalizer>,
}

impl<T: Send + 'static> ThreadsafeFunctionBuilder<T> {
    fn with_callback(callback: TsfnCallback<T>, function: Option<Handle>) -> Self {
        Self {
            name: "threadsafe function".to_string(),
            max_queue_size: 0,
            initial_thread_count: 1,
            context: None,
            callback,
            function,
            finalizer: None,
        }
    }

    /// Start a builder around the host-thread callback
    pub fn new<F>(mut callback: F) -> Self
    where
        F: FnMut(&Env, T) -> BridgeResult<()> + 'static,
    {
        let callback: TsfnCallback<T> =
            Box::new(move |env: &Env, _func: Option<Handle>, value: T| callback(env, value));
        Self::with_callback(callback, None)
    }

    /// Bind the proxy to host function `func`. Each queued value is handed
    /// to `callback` together with the function.
    pub fn with_function<F>(func: Handle, mut callback: F) -> Self
    where
        F: FnMut(&Env, Handle, T) -> BridgeResult<()> + 'static,
    {
        let callback: TsfnCallback<T> =
            Box::new(move |env: &Env, func: Option<Handle>, value: T| match func {
                Some(func) => callback(env, func, value),
                None => Err(BridgeError::failure("bound function was reclaimed")),
            });
        Self::with_callback(callback, Some(func))
    }

    /// Bind the proxy to host function `func` and call it with an
    /// `undefined` receiver and no arguments for each queued value.
    pub fn calling(func: Handle) -> Self {
        Self::with_function(func, |env, func, _value| {
            env.call_function(env.undefined(), func, &[]).map(drop)
        })
    }

    /// Name used in logs
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Queue capacity; 0 means unbounded
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Initial acquisition count (at least 1)
    pub fn initial_thread_count(mut self, count: usize) -> Self {
        self.initial_thread_count = count;
        self
    }

    /// Attach context data readable from any thread
    pub fn context<C: Any + Send + Sync>(mut self, context: C) -> Self {
        self.context = Some(Arc::new(context));
        self
    }

    /// Run `finalizer` on the host thread once the proxy is torn down
    pub fn on_finalize<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce(&Env) + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Create the proxy. It starts referenced.
    pub fn build(self, env: &Env) -> BridgeResult<ThreadsafeFunction<T>> {
        if self.initial_thread_count == 0 {
            return Err(BridgeError::InvalidArg(
                "initial thread count must be at least 1".to_string(),
            ));
        }
        env.ensure_live()?;
        if let Some(func) = self.function {
            let got = env.type_of(func);
            if got != ValueType::Function {
                return Err(BridgeError::TypeMismatch {
                    expected: ValueType::Function.name(),
                    got: got.name(),
                });
            }
        }

        let (queue_tx, queue_rx) = if self.max_queue_size == 0 {
            channel::unbounded()
        } else {
            channel::bounded(self.max_queue_size)
        };
        let (abort_tx, abort_rx) = channel::bounded(0);
        let loop_handle = env.loop_handle();
        loop_handle.hold();

        let shared = Arc::new(TsfnShared {
            id: TsfnId::new(),
            name: self.name,
            context_id: env.id(),
            queue_tx,
            queue_rx,
            state: Mutex::new(TsfnState {
                thread_count: self.initial_thread_count,
                closing: false,
                aborted: false,
                entering: 0,
            }),
            abort_tx: Mutex::new(Some(abort_tx)),
            abort_rx,
            dispatch_scheduled: AtomicBool::new(false),
            referenced: AtomicBool::new(true),
            finalized: AtomicBool::new(false),
            loop_handle,
            context: self.context,
        });

        let control: Arc<dyn TsfnControl> = shared.clone();
        match env.live() {
            Ok(live) => {
                live.tsfns.insert(shared.id, control.clone());
            }
            Err(err) => {
                shared.loop_handle.unhold();
                return Err(err);
            }
        }
        let function = self.function.map(|func| env.create_reference(func, 1));
        env.tsfn_hosts.borrow_mut().insert(
            shared.id,
            Box::new(HostSide {
                callback: self.callback,
                function,
                finalizer: self.finalizer,
            }),
        );
        env.tsfn_controls.borrow_mut().insert(shared.id, control);
        log::debug!(
            "{}: created {} ({}, max queue {}, {} thread(s))",
            env.id(),
            shared.id,
            shared.name,
            self.max_queue_size,
            self.initial_thread_count
        );
        Ok(ThreadsafeFunction { shared })
    }
}

impl Env {
    /// Create a threadsafe function around `callback`
    pub fn create_threadsafe_function<T, F>(
        &self,
        name: &str,
        max_queue_size: usize,
        initial_thread_count: usize,
        callback: F,
    ) -> BridgeResult<ThreadsafeFunction<T>>
    where
        T: Send + 'static,
        F: FnMut(&Env, T) -> BridgeResult<()> + 'static,
    {
        ThreadsafeFunctionBuilder::new(callback)
            .name(name)
            .max_queue_size(max_queue_size)
            .initial_thread_count(initial_thread_count)
            .build(self)
    }

    /// Threadsafe functions not yet finalized
    pub fn threadsafe_function_count(&self) -> usize {
        self.tsfn_controls.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_zero_initial_thread_count_rejected() {
        let env = Env::for_tests();
        let result = env.create_threadsafe_function("t", 0, 0, |_env, _v: u32| Ok(()));
        assert!(matches!(result, Err(BridgeError::InvalidArg(_))));
        assert_eq!(env.loop_handle().active_handles(), 0);
    }

    #[test]
    fn test_non_blocking_queue_full() {
        let env = Env::for_tests();
        let tsfn = env
            .create_threadsafe_function("t", 2, 1, |_env, _v: u32| Ok(()))
            .unwrap();
        tsfn.call(1, CallMode::NonBlocking).unwrap();
        tsfn.call(2, CallMode::NonBlocking).unwrap();
        assert_eq!(
            tsfn.call(3, CallMode::NonBlocking),
            Err(BridgeError::QueueFull)
        );
        assert_eq!(tsfn.queued(), 2);
    }

    #[test]
    fn test_dispatch_delivers_in_order() {
        let env = Env::for_tests();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let tsfn = env
            .create_threadsafe_function("t", 0, 1, move |_env, v: u32| {
                sink.borrow_mut().push(v);
                Ok(())
            })
            .unwrap();
        for v in 0..5 {
            tsfn.call(v, CallMode::NonBlocking).unwrap();
        }
        env.run_until_idle();
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_release_counts() {
        let env = Env::for_tests();
        let finalized = Rc::new(RefCell::new(0));
        let counter = finalized.clone();
        let tsfn = ThreadsafeFunctionBuilder::new(|_env, _v: u32| Ok(()))
            .initial_thread_count(1)
            .on_finalize(move |_env| *counter.borrow_mut() += 1)
            .build(&env)
            .unwrap();

        tsfn.acquire().unwrap();
        assert_eq!(tsfn.thread_count(), 2);
        tsfn.release(ReleaseMode::Release).unwrap();
        assert!(!tsfn.is_closing());
        tsfn.release(ReleaseMode::Release).unwrap();
        assert!(tsfn.is_closing());
        assert_eq!(tsfn.release(ReleaseMode::Release), Err(BridgeError::AlreadyFinal));
        assert_eq!(tsfn.acquire(), Err(BridgeError::Closing));
        assert_eq!(tsfn.call(1, CallMode::NonBlocking), Err(BridgeError::Closing));

        env.run_until_idle();
        assert!(tsfn.is_finalized());
        assert_eq!(*finalized.borrow(), 1);
        assert_eq!(env.threadsafe_function_count(), 0);
        assert_eq!(env.loop_handle().active_handles(), 0);
    }

    #[test]
    fn test_ref_unref_toggle_keep_alive() {
        let env = Env::for_tests();
        let tsfn = env
            .create_threadsafe_function("t", 0, 1, |_env, _v: u32| Ok(()))
            .unwrap();
        assert!(tsfn.is_referenced());
        assert_eq!(env.loop_handle().active_handles(), 1);

        tsfn.unref(&env).unwrap();
        tsfn.unref(&env).unwrap();
        assert_eq!(env.loop_handle().active_handles(), 0);
        tsfn.refer(&env).unwrap();
        assert_eq!(env.loop_handle().active_handles(), 1);
        assert_eq!(tsfn.thread_count(), 1);
    }

    #[test]
    fn test_context_downcast() {
        let env = Env::for_tests();
        let tsfn = ThreadsafeFunctionBuilder::new(|_env, _v: u32| Ok(()))
            .context(String::from("ctx"))
            .build(&env)
            .unwrap();
        assert_eq!(tsfn.context::<String>().as_deref().map(String::as_str), Some("ctx"));
        assert!(tsfn.context::<u32>().is_none());
    }
}
