//! The native boundary bridge
//!
//! Everything that touches host values is a method on [`Env`] and runs on
//! the host thread. Only [`ThreadsafeFunction`], [`LoopHandle`] and the
//! registries cross threads.
//!
//! [`LoopHandle`]: crate::host::reactor::LoopHandle

pub mod async_work;
pub mod callback;
pub mod env;
pub mod promise;
pub mod reference;
pub mod registry;
pub mod scope;
pub mod tsfn;
pub mod values;

pub use async_work::{AsyncWork, WorkState};
pub use callback::{CallInfo, FunctionFactory, ManagedClosure};
pub use env::Env;
pub use promise::Deferred;
pub use reference::Reference;
pub use registry::{CleanupHook, ContextEntry, ContextRegistry, UserData};
pub use scope::{EscapableScope, Handle, Scope};
pub use tsfn::{ThreadsafeFunction, ThreadsafeFunctionBuilder, TsfnContext};
