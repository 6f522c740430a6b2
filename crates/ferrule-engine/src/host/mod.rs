//! The in-process host the bridge is attached to
//!
//! - `heap`: object model, mark-sweep collection, finalizer observers
//! - `reactor`: run loop job queue, worker pool, keep-alive count

pub mod heap;
pub mod reactor;
