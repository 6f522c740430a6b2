//! Host run loop and worker pool
//!
//! The reactor is the host's scheduling primitive, which the bridge treats
//! as opaque: "submit work" (the worker pool) and "get notified on the host
//! thread" (the re-entry job queue). Any thread may post a job through a
//! [`LoopHandle`]; only the host thread drains the queue.
//!
//! A keep-alive counter tracks how many outstanding items (queued async
//! work, referenced threadsafe functions) want the loop to keep running.

use crate::bridge::Env;
use crate::config::BridgeOptions;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use ferrule_sdk::{BridgeError, BridgeResult, ContextId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ============================================================================
// Channel message types
// ============================================================================

/// Job re-entering the host thread
pub(crate) type HostJob = Box<dyn FnOnce(&Env) + Send>;

/// Plain-data work executed on a pool thread
pub(crate) type PoolWork = Box<dyn FnOnce() + Send>;

// ============================================================================
// LoopHandle
// ============================================================================

/// Thread-safe handle for re-entering a context's host thread.
#[derive(Clone)]
pub struct LoopHandle {
    context: ContextId,
    job_tx: Sender<HostJob>,
    keep_alive: Arc<AtomicUsize>,
}

impl LoopHandle {
    /// Context this loop belongs to
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Post a job to run on the host thread. Fails once the context is gone.
    pub(crate) fn post(&self, job: HostJob) -> BridgeResult<()> {
        self.job_tx
            .send(job)
            .map_err(|_| BridgeError::ContextGone(self.context))
    }

    /// Keep the run loop alive on behalf of one more item
    pub(crate) fn hold(&self) {
        self.keep_alive.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one item's claim on the run loop
    pub(crate) fn unhold(&self) {
        let prev = self.keep_alive.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "run loop keep-alive count underflow");
    }

    /// Number of items currently keeping the loop alive
    pub fn active_handles(&self) -> usize {
        self.keep_alive.load(Ordering::Acquire)
    }
}

// ============================================================================
// Worker pool
// ============================================================================

struct WorkerPool {
    work_tx: Option<Sender<PoolWork>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    fn start(options: &BridgeOptions, context: ContextId) -> Self {
        let (work_tx, work_rx) = channel::unbounded::<PoolWork>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(options.worker_threads);

        for i in 0..options.worker_threads {
            let rx = work_rx.clone();
            let shutdown = shutdown.clone();
            let spawned = thread::Builder::new()
                .name(format!(
                    "{}-worker-{}-{}",
                    options.thread_name_prefix,
                    context.as_u64(),
                    i
                ))
                .spawn(move || Self::worker_loop(rx, shutdown));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => log::error!("failed to spawn worker thread {} for {}: {}", i, context, e),
            }
        }

        Self {
            work_tx: Some(work_tx),
            workers,
            shutdown,
        }
    }

    fn worker_loop(work_rx: Receiver<PoolWork>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Acquire) {
            let work = match work_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(w) => w,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            work();
        }
    }

    fn submit(&self, work: PoolWork) -> bool {
        match &self.work_tx {
            Some(tx) if !self.workers.is_empty() => tx.send(work).is_ok(),
            _ => false,
        }
    }

    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.work_tx.take();

        let timeout = Duration::from_secs(2);
        for handle in self.workers.drain(..) {
            join_with_timeout(handle, timeout);
        }
    }
}

/// Join a thread with timeout, detach if stuck.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() > timeout {
            log::warn!(
                "detaching worker thread {:?} still busy after {:?}",
                handle.thread().name(),
                timeout
            );
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Reactor
// ============================================================================

/// Host-thread side of the run loop.
pub(crate) struct Reactor {
    handle: LoopHandle,
    job_rx: Receiver<HostJob>,
    pool: WorkerPool,
    poll_interval: Duration,
}

impl Reactor {
    /// Create the job queue and start the worker pool.
    pub fn start(context: ContextId, options: &BridgeOptions) -> Self {
        let (job_tx, job_rx) = channel::unbounded::<HostJob>();
        Self {
            handle: LoopHandle {
                context,
                job_tx,
                keep_alive: Arc::new(AtomicUsize::new(0)),
            },
            job_rx,
            pool: WorkerPool::start(options, context),
            poll_interval: options.loop_poll_interval,
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Hand plain-data work to the worker pool
    pub fn submit_work(&self, work: PoolWork) -> BridgeResult<()> {
        if self.pool.submit(work) {
            Ok(())
        } else {
            Err(BridgeError::ContextGone(self.handle.context))
        }
    }

    /// Next job if one is ready
    pub fn try_next(&self) -> Option<HostJob> {
        match self.job_rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next job
    pub fn next_timeout(&self, timeout: Duration) -> Option<HostJob> {
        self.job_rx.recv_timeout(timeout).ok()
    }

    /// Number of jobs waiting for the host thread
    pub fn pending_jobs(&self) -> usize {
        self.job_rx.len()
    }

    /// Stop the worker pool. Jobs still queued are dropped with the reactor.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
        let dropped = self.job_rx.try_iter().count();
        if dropped > 0 {
            log::warn!(
                "{}: dropped {} re-entry job(s) at teardown",
                self.handle.context,
                dropped
            );
        }
    }
}
