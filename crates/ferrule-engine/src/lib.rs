//! Ferrule Engine
//!
//! A native boundary bridge between managed closures and a single-threaded
//! host execution engine, plus the in-process host it is attached to:
//! - **Context registry**: per-context bridge state, created lazily and torn
//!   down atomically (`bridge::registry`)
//! - **Callbacks**: managed closures behind host-visible function objects
//!   (`bridge::callback`)
//! - **Handles and references**: scope-bound handles, escapable scopes and
//!   refcounted references (`bridge::scope`, `bridge::reference`)
//! - **Async work**: off-thread execute steps completed on the host thread
//!   (`bridge::async_work`)
//! - **Threadsafe functions**: queue-backed proxies callable from any thread
//!   (`bridge::tsfn`)
//! - **Host**: heap, collector, run loop and worker pool (`host`)
//!
//! # Example
//!
//! ```rust,ignore
//! use ferrule_engine::{BridgeOptions, Env};
//! use ferrule_sdk::AsyncStatus;
//!
//! let env = Env::new(BridgeOptions::from_env());
//! let work = env.create_async_work("sum", || 2 + 2, |env, status, value| {
//!     assert_eq!(status, AsyncStatus::Ok);
//!     assert_eq!(value, Some(4));
//!     Ok(())
//! })?;
//! env.queue_async_work(&work)?;
//! env.run_loop();
//! env.delete_async_work(work);
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod bridge;
pub mod config;
pub mod host;

pub use bridge::{
    AsyncWork, CallInfo, ContextEntry, ContextRegistry, Deferred, Env, EscapableScope,
    FunctionFactory, Handle, ManagedClosure, Reference, Scope, ThreadsafeFunction,
    ThreadsafeFunctionBuilder, TsfnContext, UserData, WorkState,
};
pub use config::BridgeOptions;
pub use host::heap::{GcStats, PromiseState, Value};
pub use host::reactor::LoopHandle;

// Re-export the SDK so embedders need a single dependency
pub use ferrule_sdk::{
    AsyncStatus, BridgeError, BridgeResult, CallMode, CallbackId, CleanupHookId, ContextId,
    ReferenceId, ReleaseMode, Status, TsfnId, ValueType, WorkId,
};
