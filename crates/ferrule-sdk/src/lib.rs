//! Ferrule SDK - shared types for the native boundary bridge
//!
//! This crate holds the identifiers, status codes, error type and modes
//! that appear on both sides of the bridge, without depending on the
//! bridge runtime itself.
//!
//! # Example
//!
//! ```ignore
//! use ferrule_sdk::{BridgeError, BridgeResult, CallMode};
//!
//! fn enqueue(tsfn: &ThreadsafeFunction<u32>) -> BridgeResult<()> {
//!     match tsfn.call(1, CallMode::NonBlocking) {
//!         Err(BridgeError::QueueFull) => Ok(()), // try again later
//!         other => other,
//!     }
//! }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod ids;
pub mod status;
pub mod types;

pub use error::{BridgeError, BridgeResult};
pub use ids::{CallbackId, CleanupHookId, ContextId, ReferenceId, TsfnId, WorkId};
pub use status::Status;
pub use types::{AsyncStatus, CallMode, ReleaseMode, ValueType};
