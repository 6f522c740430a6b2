//! Promises and their deferred settlers

use crate::bridge::reference::Reference;
use crate::bridge::scope::Handle;
use crate::bridge::Env;
use crate::host::heap::{ObjectKind, PromiseState, Value};
use ferrule_sdk::{BridgeError, BridgeResult};

/// Settles one promise. Consumed by resolve or reject.
///
/// Holds a strong reference, so the promise stays alive until settled.
#[derive(Debug)]
#[must_use = "an unsettled deferred keeps its promise pending forever"]
pub struct Deferred {
    reference: Reference,
}

impl Env {
    /// Create a pending promise and the deferred that settles it
    pub fn create_promise(&self) -> (Deferred, Handle) {
        let id = self
            .heap
            .borrow_mut()
            .alloc(ObjectKind::Promise(PromiseState::Pending));
        let promise = self.handle(Value::Object(id));
        let deferred = Deferred {
            reference: self.create_reference(promise, 1),
        };
        (deferred, promise)
    }

    /// Fulfil the promise with `value`
    pub fn resolve_deferred(&self, deferred: Deferred, value: Handle) -> BridgeResult<()> {
        let value = self.value(value);
        self.settle(deferred, PromiseState::Fulfilled(value))
    }

    /// Reject the promise with `reason`
    pub fn reject_deferred(&self, deferred: Deferred, reason: Handle) -> BridgeResult<()> {
        let reason = self.value(reason);
        self.settle(deferred, PromiseState::Rejected(reason))
    }

    fn settle(&self, deferred: Deferred, outcome: PromiseState) -> BridgeResult<()> {
        let promise = self
            .references
            .borrow()
            .value_of(deferred.reference.id());
        self.delete_reference(deferred.reference);

        let mut heap = self.heap.borrow_mut();
        let object = match promise.as_object() {
            Some(id) => heap.get_mut(id),
            None => None,
        };
        match object.map(|object| &mut object.kind) {
            Some(ObjectKind::Promise(state @ PromiseState::Pending)) => {
                *state = outcome;
                Ok(())
            }
            _ => Err(BridgeError::InvalidArg(
                "deferred does not refer to a pending promise".to_string(),
            )),
        }
    }

    /// Whether the value is a promise
    pub fn is_promise(&self, value: Handle) -> bool {
        let value = self.value(value);
        let heap = self.heap.borrow();
        matches!(
            value.as_object().and_then(|id| heap.get(id)).map(|o| &o.kind),
            Some(ObjectKind::Promise(_))
        )
    }

    /// Settlement state of a promise
    pub fn promise_state(&self, promise: Handle) -> BridgeResult<PromiseState> {
        let value = self.value(promise);
        let heap = self.heap.borrow();
        match value.as_object().and_then(|id| heap.get(id)).map(|o| &o.kind) {
            Some(ObjectKind::Promise(state)) => Ok(state.clone()),
            _ => Err(BridgeError::TypeMismatch {
                expected: "promise",
                got: heap.type_of(&value).name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let (deferred, promise) = env.create_promise();
            assert!(env.is_promise(promise));
            assert_eq!(env.promise_state(promise).unwrap(), PromiseState::Pending);

            let value = env.create_number(4.0);
            env.resolve_deferred(deferred, value).unwrap();
            assert_eq!(
                env.promise_state(promise).unwrap(),
                PromiseState::Fulfilled(Value::Number(4.0))
            );
        });
        assert_eq!(env.reference_table_len(), 0);
    }

    #[test]
    fn test_reject() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let (deferred, promise) = env.create_promise();
            let reason = env.create_error(None, "nope");
            env.reject_deferred(deferred, reason).unwrap();
            assert!(matches!(
                env.promise_state(promise).unwrap(),
                PromiseState::Rejected(Value::Object(_))
            ));
        });
    }

    #[test]
    fn test_pending_promise_survives_collection() {
        let env = Env::for_tests();
        let deferred = env.run_in_scope(|env| env.create_promise().0);
        env.collect_garbage();
        env.run_in_scope(|env| {
            let value = env.undefined();
            env.resolve_deferred(deferred, value).unwrap();
        });
    }

    #[test]
    fn test_promise_state_of_non_promise() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let obj = env.create_object();
            assert!(!env.is_promise(obj));
            assert!(matches!(
                env.promise_state(obj),
                Err(BridgeError::TypeMismatch { expected: "promise", .. })
            ));
        });
    }
}
