//! Handle scopes
//!
//! Handles are transient references to host values, valid only while the
//! scope that produced them is open. Scopes form a strict stack: closing
//! anything but the innermost scope is a contract violation and aborts.
//!
//! Three frame kinds share the stack:
//! - `Call` frames, opened implicitly for every host-originated call and
//!   every re-entry job
//! - `Plain` frames, opened and closed by managed code
//! - `Escapable` frames, which may promote exactly one handle to their parent

use crate::bridge::Env;
use crate::host::heap::{ObjectId, Value};
use ferrule_sdk::{BridgeError, BridgeResult};
use std::marker::PhantomData;

/// Identity of one opened scope; never reused
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ScopeId(u64);

/// Transient reference to a host value.
///
/// Copyable, but valid only while its scope is open. Using a handle after
/// its scope has closed aborts.
#[derive(Debug, Copy, Clone)]
pub struct Handle {
    scope: ScopeId,
    slot: u32,
    _host_thread: PhantomData<*const ()>,
}

/// A plain handle scope, closed with [`Env::close_scope`]
#[derive(Debug)]
#[must_use = "scopes must be closed explicitly"]
pub struct Scope {
    id: ScopeId,
    _host_thread: PhantomData<*const ()>,
}

/// A scope that may promote one handle to its parent, closed with
/// [`Env::close_escapable_scope`]
#[derive(Debug)]
#[must_use = "scopes must be closed explicitly"]
pub struct EscapableScope {
    id: ScopeId,
    _host_thread: PhantomData<*const ()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Call,
    Plain,
    Escapable { escaped: bool },
}

struct Frame {
    id: ScopeId,
    kind: FrameKind,
    values: Vec<Value>,
}

/// Stack of open scopes of one context
pub(crate) struct ScopeStack {
    frames: Vec<Frame>,
    next_id: u64,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of open scopes
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_frame(&mut self, kind: FrameKind) -> ScopeId {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        self.frames.push(Frame {
            id,
            kind,
            values: Vec::new(),
        });
        id
    }

    /// Close the innermost scope, which must be `id`.
    pub fn pop_frame(&mut self, id: ScopeId) {
        match self.frames.last() {
            Some(top) if top.id == id => {
                self.frames.pop();
            }
            Some(top) => panic!(
                "handle scope {} closed out of order: innermost open scope is {} ({:?})",
                id.0, top.id.0, top.kind
            ),
            None => panic!("handle scope {} closed but no scope is open", id.0),
        }
    }

    fn position(&self, id: ScopeId) -> Option<usize> {
        self.frames.iter().rposition(|frame| frame.id == id)
    }

    /// Store a value in the innermost scope
    pub fn alloc(&mut self, value: Value) -> Handle {
        let Some(frame) = self.frames.last_mut() else {
            panic!("handle created outside of any handle scope");
        };
        Self::push_into(frame, value)
    }

    fn push_into(frame: &mut Frame, value: Value) -> Handle {
        let slot = frame.values.len() as u32;
        frame.values.push(value);
        Handle {
            scope: frame.id,
            slot,
            _host_thread: PhantomData,
        }
    }

    /// Value behind a handle. Aborts on a stale handle.
    pub fn resolve(&self, handle: Handle) -> &Value {
        let Some(index) = self.position(handle.scope) else {
            panic!("stale handle: scope {} is no longer open", handle.scope.0);
        };
        match self.frames[index].values.get(handle.slot as usize) {
            Some(value) => value,
            None => panic!(
                "invalid handle: slot {} does not exist in scope {}",
                handle.slot, handle.scope.0
            ),
        }
    }

    /// Promote `handle` out of the escapable scope `id` into its parent.
    pub fn escape(&mut self, id: ScopeId, handle: Handle) -> BridgeResult<Handle> {
        let Some(index) = self.position(id) else {
            panic!("escape through closed scope {}", id.0);
        };
        match self.frames[index].kind {
            FrameKind::Escapable { escaped: true } => return Err(BridgeError::EscapeCalledTwice),
            FrameKind::Escapable { escaped: false } => {}
            other => panic!("escape through non-escapable scope {} ({:?})", id.0, other),
        }
        if index == 0 {
            return Err(BridgeError::InvalidArg(
                "escapable scope has no parent scope".to_string(),
            ));
        }

        let value = self.resolve(handle).clone();
        self.frames[index].kind = FrameKind::Escapable { escaped: true };
        Ok(Self::push_into(&mut self.frames[index - 1], value))
    }

    /// Objects reachable from any open scope
    pub fn roots(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.frames
            .iter()
            .flat_map(|frame| frame.values.iter())
            .filter_map(Value::as_object)
    }
}

// ============================================================================
// Env surface
// ============================================================================

impl Env {
    /// Open a plain handle scope
    pub fn open_scope(&self) -> Scope {
        let id = self.scopes.borrow_mut().push_frame(FrameKind::Plain);
        Scope {
            id,
            _host_thread: PhantomData,
        }
    }

    /// Close a plain handle scope. Aborts unless it is the innermost scope.
    pub fn close_scope(&self, scope: Scope) {
        self.scopes.borrow_mut().pop_frame(scope.id);
    }

    /// Open an escapable handle scope
    pub fn open_escapable_scope(&self) -> EscapableScope {
        let id = self
            .scopes
            .borrow_mut()
            .push_frame(FrameKind::Escapable { escaped: false });
        EscapableScope {
            id,
            _host_thread: PhantomData,
        }
    }

    /// Close an escapable handle scope. Aborts unless it is the innermost scope.
    pub fn close_escapable_scope(&self, scope: EscapableScope) {
        self.scopes.borrow_mut().pop_frame(scope.id);
    }

    /// Promote `handle` to the parent of `scope`.
    ///
    /// Succeeds at most once per scope; later calls fail with
    /// `EscapeCalledTwice` and promote nothing.
    pub fn escape_handle(&self, scope: &EscapableScope, handle: Handle) -> BridgeResult<Handle> {
        self.scopes.borrow_mut().escape(scope.id, handle)
    }

    /// Run `f` inside a fresh scope, the way the host enters managed code.
    pub fn run_in_scope<R>(&self, f: impl FnOnce(&Env) -> R) -> R {
        let id = self.scopes.borrow_mut().push_frame(FrameKind::Call);
        let result = f(self);
        self.scopes.borrow_mut().pop_frame(id);
        result
    }

    /// Number of open scopes
    pub fn scope_depth(&self) -> usize {
        self.scopes.borrow().depth()
    }

    /// Host value behind a handle
    pub(crate) fn value(&self, handle: Handle) -> Value {
        self.scopes.borrow().resolve(handle).clone()
    }

    /// New handle to `value` in the innermost scope
    pub(crate) fn handle(&self, value: Value) -> Handle {
        self.scopes.borrow_mut().alloc(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_resolve() {
        let mut stack = ScopeStack::new();
        let id = stack.push_frame(FrameKind::Call);
        let h = stack.alloc(Value::Number(4.0));
        assert_eq!(stack.resolve(h), &Value::Number(4.0));
        stack.pop_frame(id);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn test_stale_handle_aborts() {
        let mut stack = ScopeStack::new();
        let outer = stack.push_frame(FrameKind::Call);
        let inner = stack.push_frame(FrameKind::Plain);
        let h = stack.alloc(Value::Boolean(true));
        stack.pop_frame(inner);
        let _ = stack.resolve(h);
        stack.pop_frame(outer);
    }

    #[test]
    #[should_panic(expected = "closed out of order")]
    fn test_out_of_order_close_aborts() {
        let mut stack = ScopeStack::new();
        let outer = stack.push_frame(FrameKind::Plain);
        let _inner = stack.push_frame(FrameKind::Plain);
        stack.pop_frame(outer);
    }

    #[test]
    #[should_panic(expected = "outside of any handle scope")]
    fn test_alloc_without_scope_aborts() {
        let mut stack = ScopeStack::new();
        stack.alloc(Value::Null);
    }

    #[test]
    fn test_escape_once() {
        let mut stack = ScopeStack::new();
        let outer = stack.push_frame(FrameKind::Call);
        let esc = stack.push_frame(FrameKind::Escapable { escaped: false });
        let a = stack.alloc(Value::Number(1.0));
        let b = stack.alloc(Value::Number(2.0));

        let escaped = stack.escape(esc, a).unwrap();
        assert!(matches!(
            stack.escape(esc, b),
            Err(BridgeError::EscapeCalledTwice)
        ));
        stack.pop_frame(esc);

        assert_eq!(stack.resolve(escaped), &Value::Number(1.0));
        stack.pop_frame(outer);
    }

    #[test]
    fn test_escape_without_parent() {
        let mut stack = ScopeStack::new();
        let esc = stack.push_frame(FrameKind::Escapable { escaped: false });
        let h = stack.alloc(Value::Null);
        assert!(matches!(stack.escape(esc, h), Err(BridgeError::InvalidArg(_))));
    }

    #[test]
    fn test_roots_cover_open_frames() {
        let mut heap = crate::host::heap::Heap::new();
        let obj = heap.alloc(crate::host::heap::ObjectKind::Plain);
        let mut stack = ScopeStack::new();
        stack.push_frame(FrameKind::Call);
        stack.alloc(Value::Object(obj));
        stack.alloc(Value::Number(1.0));
        assert_eq!(stack.roots().collect::<Vec<_>>(), vec![obj]);
    }
}
