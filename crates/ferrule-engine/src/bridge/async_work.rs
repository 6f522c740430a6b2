//! Async work queue
//!
//! An [`AsyncWork`] pairs an execute step, run on the worker pool with
//! plain data only, with a complete step delivered back on the host thread
//! inside a fresh scope. The complete step stays on the host side of the
//! boundary; only the execute step and its output cross threads.
//!
//! ```text
//! Created ──queue──▶ Queued ──pool──▶ Executing ──▶ CompletionPending ──▶ Delivered
//!                      │
//!                      └──cancel──▶ Cancelled (complete runs with AsyncStatus::Cancelled)
//! ```

use crate::bridge::Env;
use crate::host::reactor::{LoopHandle, PoolWork};
use ferrule_sdk::{AsyncStatus, BridgeError, BridgeResult, WorkId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Complete step, kept on the host thread
pub(crate) type Completion = Box<dyn FnOnce(&Env, AsyncStatus) -> BridgeResult<()>>;

// ============================================================================
// WorkState
// ============================================================================

/// Lifecycle state of an async work item
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    /// Created, not queued yet
    Created = 0,
    /// Waiting for a pool thread
    Queued = 1,
    /// Execute step running on a pool thread
    Executing = 2,
    /// Execute step finished; complete step not delivered yet
    CompletionPending = 3,
    /// Complete step ran with `AsyncStatus::Ok`
    Delivered = 4,
    /// Cancelled while queued
    Cancelled = 5,
}

impl WorkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkState::Created,
            1 => WorkState::Queued,
            2 => WorkState::Executing,
            3 => WorkState::CompletionPending,
            4 => WorkState::Delivered,
            _ => WorkState::Cancelled,
        }
    }
}

pub(crate) struct WorkShared {
    id: WorkId,
    name: String,
    state: AtomicU8,
    execute: Mutex<Option<PoolWork>>,
}

impl WorkShared {
    fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WorkState, to: WorkState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ============================================================================
// WorkRegistry
// ============================================================================

/// Async work items of one context
pub(crate) struct WorkRegistry {
    items: Mutex<FxHashMap<WorkId, Arc<WorkShared>>>,
    in_flight: AtomicUsize,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(FxHashMap::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn insert(&self, work: Arc<WorkShared>) {
        self.items.lock().insert(work.id, work);
    }

    fn remove(&self, id: WorkId) -> bool {
        self.items.lock().remove(&id).is_some()
    }

    /// Items created and not yet deleted
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Items queued whose completion has not been delivered
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Names of items still queued or executing
    pub fn outstanding(&self) -> Vec<String> {
        self.items
            .lock()
            .values()
            .filter(|work| {
                matches!(
                    work.state(),
                    WorkState::Queued | WorkState::Executing | WorkState::CompletionPending
                )
            })
            .map(|work| format!("{} ({})", work.id, work.name))
            .collect()
    }
}

// ============================================================================
// AsyncWork
// ============================================================================

/// A deferred unit of work. Must be deleted with [`Env::delete_async_work`].
#[must_use = "async work must be queued or deleted"]
pub struct AsyncWork {
    shared: Arc<WorkShared>,
    _host_thread: PhantomData<*const ()>,
}

impl AsyncWork {
    /// Registry key of this item
    pub fn id(&self) -> WorkId {
        self.shared.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkState {
        self.shared.state()
    }
}

impl std::fmt::Debug for AsyncWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWork")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Post the completion of `work` back to the host thread.
fn post_completion(handle: &LoopHandle, work: Arc<WorkShared>, status: AsyncStatus) {
    let id = work.id;
    let posted = handle.post(Box::new(move |env: &Env| {
        env.deliver_async_work(&work, status);
    }));
    if posted.is_err() {
        log::warn!(
            "{}: completion of {} dropped, context is gone",
            handle.context(),
            id
        );
    }
}

// ============================================================================
// Env surface
// ============================================================================

impl Env {
    /// Create an async work item.
    ///
    /// `execute` runs on the worker pool; `complete` runs on the host thread
    /// with the execute output, or with `None` if the work was cancelled.
    pub fn create_async_work<T, E, C>(
        &self,
        name: &str,
        execute: E,
        complete: C,
    ) -> BridgeResult<AsyncWork>
    where
        T: Send + 'static,
        E: FnOnce() -> T + Send + 'static,
        C: FnOnce(&Env, AsyncStatus, Option<T>) -> BridgeResult<()> + 'static,
    {
        let output: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let slot = output.clone();
        let execute: PoolWork = Box::new(move || {
            let value = execute();
            *slot.lock() = Some(value);
        });
        let completion: Completion = Box::new(move |env: &Env, status: AsyncStatus| {
            let value = output.lock().take();
            complete(env, status, value)
        });

        let shared = Arc::new(WorkShared {
            id: WorkId::new(),
            name: name.to_string(),
            state: AtomicU8::new(WorkState::Created as u8),
            execute: Mutex::new(Some(execute)),
        });
        self.live()?.works.insert(shared.clone());
        self.completions.borrow_mut().insert(shared.id, completion);
        log::debug!("{}: created {} ({})", self.id(), shared.id, name);

        Ok(AsyncWork {
            shared,
            _host_thread: PhantomData,
        })
    }

    /// Hand the work to the worker pool. Items are one-shot: queueing
    /// anything but a freshly created item fails with `InvalidArg`.
    pub fn queue_async_work(&self, work: &AsyncWork) -> BridgeResult<()> {
        let live = self.live()?;
        if !work.shared.transition(WorkState::Created, WorkState::Queued) {
            return Err(BridgeError::InvalidArg(format!(
                "{} cannot be queued from state {:?}",
                work.id(),
                work.state()
            )));
        }

        let handle = self.loop_handle();
        handle.hold();
        live.works.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(live);

        let shared = work.shared.clone();
        let pool_handle = handle.clone();
        let submitted = self.reactor.borrow().submit_work(Box::new(move || {
            if !shared.transition(WorkState::Queued, WorkState::Executing) {
                // Cancelled before a pool thread picked it up
                return;
            }
            let execute = shared.execute.lock().take();
            if let Some(execute) = execute {
                execute();
            }
            shared
                .state
                .store(WorkState::CompletionPending as u8, Ordering::Release);
            post_completion(&pool_handle, shared, AsyncStatus::Ok);
        }));

        if let Err(err) = submitted {
            work.shared
                .state
                .store(WorkState::Created as u8, Ordering::Release);
            handle.unhold();
            if let Ok(live) = self.live() {
                live.works.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(err);
        }
        log::debug!("{}: queued {}", self.id(), work.id());
        Ok(())
    }

    /// Cancel queued work. Fails with `CancelRejected` once execution has
    /// started; the complete step then still runs with `AsyncStatus::Ok`.
    pub fn cancel_async_work(&self, work: &AsyncWork) -> BridgeResult<()> {
        if !work.shared.transition(WorkState::Queued, WorkState::Cancelled) {
            return Err(BridgeError::CancelRejected);
        }
        work.shared.execute.lock().take();
        post_completion(&self.loop_handle(), work.shared.clone(), AsyncStatus::Cancelled);
        log::debug!("{}: cancelled {}", self.id(), work.id());
        Ok(())
    }

    /// Delete a work item.
    ///
    /// Only valid before queueing, after delivery, after a successful
    /// cancel, or once the context is torn down; anything else aborts.
    pub fn delete_async_work(&self, work: AsyncWork) {
        if self.live().is_err() {
            // Items of a torn-down context are already invalid
            self.completions.borrow_mut().remove(&work.id());
            log::debug!("{}: deleted {} after teardown", self.id(), work.id());
            return;
        }
        match work.state() {
            WorkState::Created | WorkState::Delivered | WorkState::Cancelled => {}
            state => panic!(
                "{} deleted before its completion was delivered (state {:?})",
                work.id(),
                state
            ),
        }
        if work.state() == WorkState::Created {
            self.completions.borrow_mut().remove(&work.id());
        }
        if let Ok(live) = self.live() {
            live.works.remove(work.id());
        }
        log::debug!("{}: deleted {}", self.id(), work.id());
    }

    /// Run the complete step of `work`. Called from a re-entry job.
    fn deliver_async_work(&self, work: &WorkShared, status: AsyncStatus) {
        self.loop_handle().unhold();
        match self.live() {
            Ok(live) => {
                live.works.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(_) => {
                self.completions.borrow_mut().remove(&work.id);
                log::warn!(
                    "{}: completion of {} ({}) dropped, context is gone",
                    self.id(),
                    work.id,
                    work.name
                );
                return;
            }
        }
        if status == AsyncStatus::Ok {
            work.transition(WorkState::CompletionPending, WorkState::Delivered);
        }

        let completion = self.completions.borrow_mut().remove(&work.id);
        let Some(completion) = completion else {
            return;
        };
        log::debug!("{}: delivering {} ({:?})", self.id(), work.id, status);
        if let Err(err) = completion(self, status) {
            self.throw_bridge_error(err);
        }
    }

    /// Async work items created and not yet deleted
    pub fn live_async_work(&self) -> usize {
        self.live().map(|live| live.works.len()).unwrap_or(0)
    }

    /// Async work items queued whose completion has not been delivered
    pub fn in_flight_async_work(&self) -> usize {
        self.live().map(|live| live.works.in_flight()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            WorkState::Created,
            WorkState::Queued,
            WorkState::Executing,
            WorkState::CompletionPending,
            WorkState::Delivered,
            WorkState::Cancelled,
        ] {
            assert_eq!(WorkState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_delete_unqueued_work() {
        let env = Env::for_tests();
        let work = env
            .create_async_work("idle", || 1, |_env, _status, _value| Ok(()))
            .unwrap();
        assert_eq!(work.state(), WorkState::Created);
        assert_eq!(env.live_async_work(), 1);
        env.delete_async_work(work);
        assert_eq!(env.live_async_work(), 0);
    }

    #[test]
    fn test_queue_twice_rejected() {
        let env = Env::for_tests();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let work = env
            .create_async_work("once", || 5, move |_env, status, value| {
                sink.borrow_mut().push((status, value));
                Ok(())
            })
            .unwrap();

        env.queue_async_work(&work).unwrap();
        assert!(matches!(
            env.queue_async_work(&work),
            Err(BridgeError::InvalidArg(_))
        ));
        assert!(env.run_until(|_| !seen.borrow().is_empty(), Duration::from_secs(5)));
        assert_eq!(*seen.borrow(), vec![(AsyncStatus::Ok, Some(5))]);
        assert!(matches!(
            env.queue_async_work(&work),
            Err(BridgeError::InvalidArg(_))
        ));
        env.delete_async_work(work);
    }

    #[test]
    fn test_failed_completion_is_uncaught() {
        let env = Env::for_tests();
        let work = env
            .create_async_work("fails", || (), |_env, _status, _value| {
                Err(BridgeError::failure("complete failed"))
            })
            .unwrap();
        env.queue_async_work(&work).unwrap();
        assert!(env.run_until(|env| env.in_flight_async_work() == 0, Duration::from_secs(5)));
        assert_eq!(env.take_uncaught_errors(), vec!["complete failed".to_string()]);
        env.delete_async_work(work);
    }

    #[test]
    #[should_panic(expected = "deleted before its completion was delivered")]
    fn test_delete_queued_work_aborts() {
        let env = Env::for_tests();
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let work = env
            .create_async_work("blocked", move || rx.recv().ok(), |_env, _status, _value| Ok(()))
            .unwrap();
        env.queue_async_work(&work).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            env.delete_async_work(work);
        }));
        drop(tx);
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}
