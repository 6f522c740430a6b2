//! Primitive value surface
//!
//! The handful of operations the marshaling layer builds on: creating and
//! reading primitives, plain objects and named properties, errors, wrapped
//! native values, externals and finalizer observers. All of them take and
//! return [`Handle`]s and run on the host thread.

use crate::bridge::scope::Handle;
use crate::bridge::Env;
use crate::host::heap::{ObjectId, ObjectKind, Value, WrapFinalizer, Wrapped};
use ferrule_sdk::{BridgeError, BridgeResult, ValueType};
use std::any::Any;
use std::rc::Rc;

fn mismatch(expected: ValueType, got: ValueType) -> BridgeError {
    BridgeError::TypeMismatch {
        expected: expected.name(),
        got: got.name(),
    }
}

impl Env {
    // ========================================================================
    // Primitives
    // ========================================================================

    /// `undefined`
    pub fn undefined(&self) -> Handle {
        self.handle(Value::Undefined)
    }

    /// `null`
    pub fn null(&self) -> Handle {
        self.handle(Value::Null)
    }

    /// Boolean
    pub fn boolean(&self, value: bool) -> Handle {
        self.handle(Value::Boolean(value))
    }

    /// Number
    pub fn create_number(&self, value: f64) -> Handle {
        self.handle(Value::Number(value))
    }

    /// String
    pub fn create_string(&self, value: &str) -> Handle {
        self.handle(Value::String(value.into()))
    }

    pub fn get_value_number(&self, value: Handle) -> BridgeResult<f64> {
        match self.value(value) {
            Value::Number(n) => Ok(n),
            other => Err(mismatch(ValueType::Number, self.type_of_value(&other))),
        }
    }

    pub fn get_value_string(&self, value: Handle) -> BridgeResult<String> {
        match self.value(value) {
            Value::String(s) => Ok(s.to_string()),
            other => Err(mismatch(ValueType::String, self.type_of_value(&other))),
        }
    }

    pub fn get_value_bool(&self, value: Handle) -> BridgeResult<bool> {
        match self.value(value) {
            Value::Boolean(b) => Ok(b),
            other => Err(mismatch(ValueType::Boolean, self.type_of_value(&other))),
        }
    }

    /// Type tag of a value
    pub fn type_of(&self, value: Handle) -> ValueType {
        self.type_of_value(&self.value(value))
    }

    /// Strict equality (`NaN` is unequal to itself, objects compare by identity)
    pub fn strict_equals(&self, a: Handle, b: Handle) -> bool {
        self.value(a) == self.value(b)
    }

    // ========================================================================
    // Objects and properties
    // ========================================================================

    /// New empty object
    pub fn create_object(&self) -> Handle {
        let id = self.heap.borrow_mut().alloc(ObjectKind::Plain);
        self.handle(Value::Object(id))
    }

    /// The global object
    pub fn global(&self) -> Handle {
        let id = self.heap.borrow().global();
        self.handle(Value::Object(id))
    }

    pub fn set_named_property(&self, object: Handle, key: &str, value: Handle) -> BridgeResult<()> {
        let id = self.object_id(object)?;
        let value = self.value(value);
        if let Some(object) = self.heap.borrow_mut().get_mut(id) {
            object.properties.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Property `key`, or `undefined` if absent
    pub fn get_named_property(&self, object: Handle, key: &str) -> BridgeResult<Handle> {
        let id = self.object_id(object)?;
        let value = self
            .heap
            .borrow()
            .get(id)
            .and_then(|object| object.properties.get(key).cloned())
            .unwrap_or(Value::Undefined);
        Ok(self.handle(value))
    }

    pub fn has_named_property(&self, object: Handle, key: &str) -> BridgeResult<bool> {
        let id = self.object_id(object)?;
        Ok(self
            .heap
            .borrow()
            .get(id)
            .map_or(false, |object| object.properties.contains_key(key)))
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// New error object with a `message` and an optional `code` property
    pub fn create_error(&self, code: Option<&str>, message: &str) -> Handle {
        let error = self.new_error(code, message);
        self.handle(error)
    }

    /// Error object that is not yet held by any scope
    pub(crate) fn new_error(&self, code: Option<&str>, message: &str) -> Value {
        let mut heap = self.heap.borrow_mut();
        let id = heap.alloc(ObjectKind::Error);
        if let Some(object) = heap.get_mut(id) {
            object
                .properties
                .insert("message".to_string(), Value::String(message.into()));
            if let Some(code) = code {
                object
                    .properties
                    .insert("code".to_string(), Value::String(code.into()));
            }
        }
        Value::Object(id)
    }

    pub fn is_error(&self, value: Handle) -> bool {
        let value = self.value(value);
        let heap = self.heap.borrow();
        matches!(
            value.as_object().and_then(|id| heap.get(id)).map(|o| &o.kind),
            Some(ObjectKind::Error)
        )
    }

    // ========================================================================
    // Wrap
    // ========================================================================

    /// Associate a native value with an object
    pub fn wrap<T: 'static>(&self, object: Handle, data: T) -> BridgeResult<()> {
        self.wrap_inner(object, Rc::new(data), None)
    }

    /// Associate a native value with an object, with a finalizer run once
    /// the object is reclaimed
    pub fn wrap_with_finalizer<T, F>(
        &self,
        object: Handle,
        data: T,
        finalize: F,
    ) -> BridgeResult<()>
    where
        T: 'static,
        F: FnOnce(&Env, Rc<T>) + 'static,
    {
        let finalizer: WrapFinalizer = Box::new(move |env: &Env, data: Rc<dyn Any>| {
            if let Ok(data) = data.downcast::<T>() {
                finalize(env, data);
            }
        });
        self.wrap_inner(object, Rc::new(data), Some(finalizer))
    }

    fn wrap_inner(
        &self,
        object: Handle,
        data: Rc<dyn Any>,
        finalizer: Option<WrapFinalizer>,
    ) -> BridgeResult<()> {
        let id = self.object_id(object)?;
        let mut heap = self.heap.borrow_mut();
        let Some(object) = heap.get_mut(id) else {
            return Err(BridgeError::InvalidArg("object has been reclaimed".to_string()));
        };
        if object.wrapped.is_some() {
            return Err(BridgeError::InvalidArg("object is already wrapped".to_string()));
        }
        object.wrapped = Some(Wrapped { data, finalizer });
        Ok(())
    }

    /// Native value wrapped by an object
    pub fn unwrap<T: 'static>(&self, object: Handle) -> BridgeResult<Rc<T>> {
        let id = self.object_id(object)?;
        let data = self
            .heap
            .borrow()
            .get(id)
            .and_then(|object| object.wrapped.as_ref())
            .map(|wrapped| wrapped.data.clone())
            .ok_or_else(|| BridgeError::InvalidArg("object is not wrapped".to_string()))?;
        data.downcast::<T>()
            .map_err(|_| BridgeError::InvalidArg("wrapped value has a different type".to_string()))
    }

    /// Detach the wrapped value. Its finalizer will not run.
    pub fn remove_wrap<T: 'static>(&self, object: Handle) -> BridgeResult<Rc<T>> {
        let id = self.object_id(object)?;
        let mut heap = self.heap.borrow_mut();
        let object = heap
            .get_mut(id)
            .ok_or_else(|| BridgeError::InvalidArg("object has been reclaimed".to_string()))?;
        match &object.wrapped {
            None => return Err(BridgeError::InvalidArg("object is not wrapped".to_string())),
            Some(wrapped) if !wrapped.data.is::<T>() => {
                return Err(BridgeError::InvalidArg(
                    "wrapped value has a different type".to_string(),
                ))
            }
            Some(_) => {}
        }
        let wrapped = object
            .wrapped
            .take()
            .ok_or_else(|| BridgeError::InvalidArg("object is not wrapped".to_string()))?;
        wrapped
            .data
            .downcast::<T>()
            .map_err(|_| BridgeError::InvalidArg("wrapped value has a different type".to_string()))
    }

    // ========================================================================
    // Externals and finalizers
    // ========================================================================

    /// Host value owning opaque native data
    pub fn create_external<T: 'static>(&self, data: T) -> Handle {
        let id = self
            .heap
            .borrow_mut()
            .alloc(ObjectKind::External(Rc::new(data)));
        self.handle(Value::Object(id))
    }

    /// External whose finalizer receives the data once the host reclaims it
    pub fn create_external_with_finalizer<T, F>(&self, data: T, finalize: F) -> Handle
    where
        T: 'static,
        F: FnOnce(&Env, Rc<T>) + 'static,
    {
        let data = Rc::new(data);
        let kept = data.clone();
        let mut heap = self.heap.borrow_mut();
        let id = heap.alloc(ObjectKind::External(data));
        heap.add_finalizer(id, Box::new(move |env: &Env| finalize(env, kept)));
        drop(heap);
        self.handle(Value::Object(id))
    }

    pub fn get_value_external<T: 'static>(&self, value: Handle) -> BridgeResult<Rc<T>> {
        let value = self.value(value);
        let heap = self.heap.borrow();
        let data = match value.as_object().and_then(|id| heap.get(id)).map(|o| &o.kind) {
            Some(ObjectKind::External(data)) => data.clone(),
            _ => return Err(mismatch(ValueType::External, heap.type_of(&value))),
        };
        drop(heap);
        data.downcast::<T>()
            .map_err(|_| BridgeError::InvalidArg("external holds a different type".to_string()))
    }

    /// Run `finalize` on the host thread once the object is reclaimed
    pub fn add_finalizer<F>(&self, object: Handle, finalize: F) -> BridgeResult<()>
    where
        F: FnOnce(&Env) + 'static,
    {
        let id = self.object_id(object)?;
        if self.heap.borrow_mut().add_finalizer(id, Box::new(finalize)) {
            Ok(())
        } else {
            Err(BridgeError::InvalidArg("object has been reclaimed".to_string()))
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn object_id(&self, handle: Handle) -> BridgeResult<ObjectId> {
        let value = self.value(handle);
        match value.as_object() {
            Some(id) => Ok(id),
            None => Err(mismatch(ValueType::Object, self.type_of_value(&value))),
        }
    }

    fn type_of_value(&self, value: &Value) -> ValueType {
        self.heap.borrow().type_of(value)
    }

    /// Human-readable rendering of a thrown value
    pub(crate) fn describe(&self, value: &Value) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.to_string(),
            Value::Object(id) => {
                let heap = self.heap.borrow();
                let Some(object) = heap.get(*id) else {
                    return "[reclaimed object]".to_string();
                };
                let prop = |key: &str| match object.properties.get(key) {
                    Some(Value::String(s)) => Some(s.to_string()),
                    _ => None,
                };
                match (&object.kind, prop("code"), prop("message")) {
                    (ObjectKind::Error, Some(code), Some(message)) => {
                        format!("{}: {}", code, message)
                    }
                    (ObjectKind::Error, None, Some(message)) => message,
                    (ObjectKind::Function { name, .. }, _, _) => format!("[function {}]", name),
                    _ => "[object]".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_primitives() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let n = env.create_number(1.5);
            let s = env.create_string("hi");
            let b = env.boolean(true);
            assert_eq!(env.get_value_number(n).unwrap(), 1.5);
            assert_eq!(env.get_value_string(s).unwrap(), "hi");
            assert!(env.get_value_bool(b).unwrap());
            assert_eq!(env.type_of(env.null()), ValueType::Null);
            assert_eq!(
                env.get_value_number(s).unwrap_err(),
                BridgeError::TypeMismatch {
                    expected: "number",
                    got: "string"
                }
            );
        });
    }

    #[test]
    fn test_strict_equals() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let nan = env.create_number(f64::NAN);
            assert!(!env.strict_equals(nan, nan));
            let a = env.create_object();
            let b = env.create_object();
            assert!(env.strict_equals(a, a));
            assert!(!env.strict_equals(a, b));
        });
    }

    #[test]
    fn test_named_properties() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let obj = env.create_object();
            let v = env.create_string("x");
            env.set_named_property(obj, "key", v).unwrap();
            assert!(env.has_named_property(obj, "key").unwrap());
            let got = env.get_named_property(obj, "key").unwrap();
            assert_eq!(env.get_value_string(got).unwrap(), "x");
            let missing = env.get_named_property(obj, "nope").unwrap();
            assert_eq!(env.type_of(missing), ValueType::Undefined);

            let n = env.create_number(1.0);
            assert!(env.set_named_property(n, "key", v).is_err());
        });
    }

    #[test]
    fn test_error_objects() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let err = env.create_error(Some("E_X"), "broken");
            assert!(env.is_error(err));
            let message = env.get_named_property(err, "message").unwrap();
            assert_eq!(env.get_value_string(message).unwrap(), "broken");
            assert_eq!(env.describe(&env.value(err)), "E_X: broken");
        });
    }

    #[test]
    fn test_wrap_unwrap_remove() {
        let env = Env::for_tests();
        env.run_in_scope(|env| {
            let obj = env.create_object();
            env.wrap(obj, 42u32).unwrap();
            assert!(matches!(env.wrap(obj, 1u32), Err(BridgeError::InvalidArg(_))));
            assert_eq!(*env.unwrap::<u32>(obj).unwrap(), 42);
            assert!(env.unwrap::<String>(obj).is_err());

            assert_eq!(*env.remove_wrap::<u32>(obj).unwrap(), 42);
            assert!(env.unwrap::<u32>(obj).is_err());
        });
    }

    #[test]
    fn test_wrap_finalizer_runs_on_collection() {
        let env = Env::for_tests();
        let finalized = Rc::new(Cell::new(0));
        {
            let finalized = finalized.clone();
            env.run_in_scope(|env| {
                let obj = env.create_object();
                env.wrap_with_finalizer(obj, 7u32, move |_env, data| {
                    finalized.set(*data);
                })
                .unwrap();
            });
        }
        env.collect_garbage();
        assert_eq!(finalized.get(), 7);
    }

    #[test]
    fn test_remove_wrap_suppresses_finalizer() {
        let env = Env::for_tests();
        let finalized = Rc::new(Cell::new(false));
        {
            let finalized = finalized.clone();
            env.run_in_scope(|env| {
                let obj = env.create_object();
                env.wrap_with_finalizer(obj, (), move |_env, _data| finalized.set(true))
                    .unwrap();
                env.remove_wrap::<()>(obj).unwrap();
            });
        }
        env.collect_garbage();
        assert!(!finalized.get());
    }

    #[test]
    fn test_external_roundtrip_and_finalizer() {
        let env = Env::for_tests();
        let released = Rc::new(Cell::new(false));
        {
            let released = released.clone();
            env.run_in_scope(|env| {
                let ext = env.create_external_with_finalizer(vec![1u8, 2, 3], move |_env, data| {
                    assert_eq!(data.len(), 3);
                    released.set(true);
                });
                assert_eq!(env.type_of(ext), ValueType::External);
                assert_eq!(env.get_value_external::<Vec<u8>>(ext).unwrap().len(), 3);
                assert!(env.get_value_external::<u32>(ext).is_err());
            });
        }
        env.collect_garbage();
        assert!(released.get());
    }

    #[test]
    fn test_add_finalizer_observer() {
        let env = Env::for_tests();
        let count = Rc::new(Cell::new(0));
        {
            let count = count.clone();
            env.run_in_scope(|env| {
                let obj = env.create_object();
                let c1 = count.clone();
                env.add_finalizer(obj, move |_env| c1.set(c1.get() + 1)).unwrap();
                env.add_finalizer(obj, move |_env| count.set(count.get() + 1)).unwrap();
            });
        }
        env.collect_garbage();
        assert_eq!(count.get(), 2);
    }
}
