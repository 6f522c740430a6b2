//! Callback registry
//!
//! Managed closures live in a per-context table keyed by [`CallbackId`].
//! The host-visible function object carries only the ID; every invocation
//! goes through [`Env::call_function`], which resolves the closure, opens a
//! call scope, and turns a managed failure into a pending host exception.
//!
//! A closure is released when the host finalizes its function object, or
//! when its [`FunctionFactory`] is dropped without ever creating one.

use crate::bridge::registry::ContextEntry;
use crate::bridge::scope::{FrameKind, Handle};
use crate::bridge::Env;
use crate::host::heap::{ObjectKind, Value};
use dashmap::DashMap;
use ferrule_sdk::{BridgeError, BridgeResult, CallbackId, ValueType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A managed closure callable from the host.
///
/// Returning `Err` raises a host exception at the call site.
pub type ManagedClosure = Arc<dyn Fn(&Env, &CallInfo) -> BridgeResult<Handle> + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

pub(crate) struct CallbackEntry {
    name: String,
    closure: ManagedClosure,
    invocations: AtomicU64,
}

/// Closures registered in one context
pub(crate) struct CallbackRegistry {
    entries: DashMap<CallbackId, Arc<CallbackEntry>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, name: &str, closure: ManagedClosure) -> CallbackId {
        let id = CallbackId::new();
        self.entries.insert(
            id,
            Arc::new(CallbackEntry {
                name: name.to_string(),
                closure,
                invocations: AtomicU64::new(0),
            }),
        );
        id
    }

    /// Resolve a closure. An unknown ID means a function object outlived
    /// its closure, which is unrecoverable.
    fn resolve(&self, id: CallbackId) -> Arc<CallbackEntry> {
        match self.entries.get(&id) {
            Some(entry) => entry.clone(),
            None => panic!("unknown {}: function object outlived its closure", id),
        }
    }

    pub fn release(&self, id: CallbackId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn invocations(&self, id: CallbackId) -> Option<u64> {
        self.entries
            .get(&id)
            .map(|entry| entry.invocations.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// CallInfo
// ============================================================================

/// Receiver and arguments of one host call, all valid for the call scope
#[derive(Debug)]
pub struct CallInfo {
    this: Handle,
    args: Vec<Handle>,
    callback: CallbackId,
}

impl CallInfo {
    /// `this`-like receiver
    pub fn this(&self) -> Handle {
        self.this
    }

    /// All arguments
    pub fn args(&self) -> &[Handle] {
        &self.args
    }

    /// Argument `index`, if passed
    pub fn arg(&self, index: usize) -> Option<Handle> {
        self.args.get(index).copied()
    }

    /// Number of arguments passed
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether no arguments were passed
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Closure being invoked
    pub fn callback(&self) -> CallbackId {
        self.callback
    }
}

// ============================================================================
// FunctionFactory
// ============================================================================

/// Creates the host-visible function object for a registered closure.
///
/// Consumed by [`FunctionFactory::create`]. Dropping an unused factory
/// releases the closure.
#[must_use = "dropping a factory releases its closure"]
pub struct FunctionFactory {
    callback: CallbackId,
    name: String,
    entry: Arc<ContextEntry>,
    created: bool,
}

impl FunctionFactory {
    /// Registry key of the closure
    pub fn callback(&self) -> CallbackId {
        self.callback
    }

    /// Create the function object. Its finalizer releases the closure.
    pub fn create(mut self, env: &Env) -> BridgeResult<Handle> {
        if env.id() != self.entry.id() {
            return Err(BridgeError::InvalidArg(format!(
                "{} belongs to {}, not {}",
                self.callback,
                self.entry.id(),
                env.id()
            )));
        }
        env.ensure_live()?;

        let callback = self.callback;
        let id = env.heap.borrow_mut().alloc(ObjectKind::Function {
            name: std::mem::take(&mut self.name),
            callback,
        });
        env.heap
            .borrow_mut()
            .add_finalizer(id, Box::new(move |env: &Env| {
                env.release_callback(callback);
            }));
        self.created = true;
        Ok(env.handle(Value::Object(id)))
    }
}

impl Drop for FunctionFactory {
    fn drop(&mut self) {
        if self.created {
            return;
        }
        if let Ok(live) = self.entry.live() {
            live.callbacks.release(self.callback);
            log::trace!("{}: released unused {}", self.entry.id(), self.callback);
        }
    }
}

impl std::fmt::Debug for FunctionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionFactory")
            .field("callback", &self.callback)
            .field("name", &self.name)
            .field("context", &self.entry.id())
            .finish()
    }
}

// ============================================================================
// Env surface
// ============================================================================

impl Env {
    /// Register a managed closure and return the factory for its function
    /// object.
    pub fn register_closure<F>(&self, name: &str, closure: F) -> BridgeResult<FunctionFactory>
    where
        F: Fn(&Env, &CallInfo) -> BridgeResult<Handle> + Send + Sync + 'static,
    {
        let entry = self.entry().clone();
        let callback = entry.live()?.callbacks.register(name, Arc::new(closure));
        log::trace!("{}: registered {} ({})", self.id(), callback, name);
        Ok(FunctionFactory {
            callback,
            name: name.to_string(),
            entry,
            created: false,
        })
    }

    /// Register a closure and create its function object in one step
    pub fn create_function<F>(&self, name: &str, closure: F) -> BridgeResult<Handle>
    where
        F: Fn(&Env, &CallInfo) -> BridgeResult<Handle> + Send + Sync + 'static,
    {
        self.register_closure(name, closure)?.create(self)
    }

    /// Call a function object with receiver `recv`.
    ///
    /// If the callee raises, the exception is left pending and the call
    /// fails with `PendingException`.
    pub fn call_function(
        &self,
        recv: Handle,
        func: Handle,
        args: &[Handle],
    ) -> BridgeResult<Handle> {
        if self.is_exception_pending() {
            return Err(BridgeError::PendingException);
        }

        let func_value = self.value(func);
        let callback = {
            let heap = self.heap.borrow();
            let kind = func_value
                .as_object()
                .and_then(|id| heap.get(id))
                .map(|object| &object.kind);
            match kind {
                Some(ObjectKind::Function { callback, .. }) => *callback,
                _ => {
                    return Err(BridgeError::TypeMismatch {
                        expected: ValueType::Function.name(),
                        got: heap.type_of(&func_value).name(),
                    })
                }
            }
        };

        // Never hold the registry guard across managed code
        let entry = self.live()?.callbacks.resolve(callback);
        entry.invocations.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: invoking {} ({})", self.id(), callback, entry.name);

        let recv = self.value(recv);
        let args: Vec<Value> = args.iter().map(|h| self.value(*h)).collect();

        let frame = self.scopes.borrow_mut().push_frame(FrameKind::Call);
        let info = CallInfo {
            this: self.handle(recv),
            args: args.into_iter().map(|v| self.handle(v)).collect(),
            callback,
        };
        let result = match (entry.closure)(self, &info) {
            Ok(handle) => self.value(handle),
            Err(err) => {
                self.throw_bridge_error(err);
                Value::Undefined
            }
        };
        self.scopes.borrow_mut().pop_frame(frame);

        if self.is_exception_pending() {
            return Err(BridgeError::PendingException);
        }
        Ok(self.handle(result))
    }

    /// Release a closure explicitly. Returns `false` if it was already
    /// released.
    pub fn release_callback(&self, callback: CallbackId) -> bool {
        match self.live() {
            Ok(live) => live.callbacks.release(callback),
            Err(_) => false,
        }
    }

    /// Whether a closure is still registered
    pub fn has_callback(&self, callback: CallbackId) -> bool {
        self.live()
            .map(|live| live.callbacks.contains(callback))
            .unwrap_or(false)
    }

    /// Number of closures registered in this context
    pub fn callback_count(&self) -> usize {
        self.live().map(|live| live.callbacks.len()).unwrap_or(0)
    }

    /// How many times a closure has been invoked
    pub fn callback_invocations(&self, callback: CallbackId) -> Option<u64> {
        self.live().ok()?.callbacks.invocations(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ManagedClosure {
        Arc::new(|env: &Env, _info: &CallInfo| Ok(env.undefined()))
    }

    #[test]
    fn test_register_and_release() {
        let registry = CallbackRegistry::new();
        let id = registry.register("f", noop());
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    #[should_panic(expected = "outlived its closure")]
    fn test_resolve_unknown_aborts() {
        let registry = CallbackRegistry::new();
        let id = registry.register("f", noop());
        registry.release(id);
        registry.resolve(id);
    }

    #[test]
    fn test_unused_factory_releases_closure() {
        let env = Env::for_tests();
        let factory = env
            .register_closure("unused", |env, _info| Ok(env.undefined()))
            .unwrap();
        let callback = factory.callback();
        assert!(env.has_callback(callback));

        drop(factory);
        assert!(!env.has_callback(callback));
        assert_eq!(env.callback_count(), 0);
    }

    #[test]
    fn test_call_receives_this_and_args() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let func = env
                .create_function("sum", |env, info| {
                    assert_eq!(info.len(), 2);
                    let this = env.get_value_number(info.this())?;
                    let a = env.get_value_number(info.args()[0])?;
                    let b = env.get_value_number(info.args()[1])?;
                    Ok(env.create_number(this + a + b))
                })
                .unwrap();

            let recv = env.create_number(100.0);
            let args = [env.create_number(1.0), env.create_number(2.0)];
            let result = env.call_function(recv, func, &args).unwrap();
            assert_eq!(env.get_value_number(result).unwrap(), 103.0);
        });
    }

    #[test]
    fn test_call_non_function() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let recv = env.undefined();
            let not_func = env.create_number(1.0);
            assert_eq!(
                env.call_function(recv, not_func, &[]).unwrap_err(),
                BridgeError::TypeMismatch {
                    expected: "function",
                    got: "number"
                }
            );
        });
    }

    #[test]
    fn test_finalized_function_releases_closure() {
        let env = Env::for_tests();
        let callback = env.run_in_scope(|env| {
            let factory = env
                .register_closure("short_lived", |env, _info| Ok(env.undefined()))
                .unwrap();
            let callback = factory.callback();
            factory.create(env).unwrap();
            callback
        });

        assert!(env.has_callback(callback));
        env.collect_garbage();
        assert!(!env.has_callback(callback));
    }
}
