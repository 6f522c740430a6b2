//! Host object model and mark-sweep collector
//!
//! The host owns every value the bridge hands out handles to. Objects live
//! in generation-tagged slots so a reclaimed slot can never be mistaken for
//! its next occupant. Collection is an explicit pass driven by the host
//! thread; reclaimed objects surrender their finalizer observers, which the
//! caller runs once the heap is no longer borrowed.

use crate::bridge::Env;
use ferrule_sdk::{CallbackId, ValueType};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::rc::Rc;

/// Generation-tagged index of a heap object
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

/// A host value.
///
/// Primitives are stored inline; objects are referenced by [`ObjectId`].
/// Values are `!Send`: they never leave the host thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean(bool),
    /// Number
    Number(f64),
    /// String
    String(Rc<str>),
    /// Heap object
    Object(ObjectId),
}

impl Value {
    /// Object ID if this value is a heap object
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }
}

/// Finalizer observer run after its object is reclaimed
pub(crate) type Finalizer = Box<dyn FnOnce(&Env)>;

/// Finalizer attached to a wrapped native value
pub(crate) type WrapFinalizer = Box<dyn FnOnce(&Env, Rc<dyn Any>)>;

/// Settlement state of a promise object
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    /// Not settled yet
    Pending,
    /// Resolved with a value
    Fulfilled(Value),
    /// Rejected with a reason
    Rejected(Value),
}

/// What kind of object a heap slot holds
pub(crate) enum ObjectKind {
    Plain,
    Function { name: String, callback: CallbackId },
    External(Rc<dyn Any>),
    Error,
    Promise(PromiseState),
}

/// Native value associated with a host object via wrap
pub(crate) struct Wrapped {
    pub data: Rc<dyn Any>,
    pub finalizer: Option<WrapFinalizer>,
}

/// A heap-allocated host object
pub(crate) struct HeapObject {
    pub kind: ObjectKind,
    pub properties: FxHashMap<String, Value>,
    pub wrapped: Option<Wrapped>,
    finalizers: Vec<Finalizer>,
}

impl HeapObject {
    fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            properties: FxHashMap::default(),
            wrapped: None,
            finalizers: Vec::new(),
        }
    }

    fn into_finalizers(self) -> Vec<PendingFinalizer> {
        let mut pending = Vec::with_capacity(self.finalizers.len() + 1);
        if let Some(Wrapped {
            data,
            finalizer: Some(finalizer),
        }) = self.wrapped
        {
            pending.push(PendingFinalizer::Wrap(finalizer, data));
        }
        pending.extend(self.finalizers.into_iter().map(PendingFinalizer::Plain));
        pending
    }

    fn children(&self, out: &mut Vec<ObjectId>) {
        out.extend(self.properties.values().filter_map(Value::as_object));
        if let ObjectKind::Promise(PromiseState::Fulfilled(v) | PromiseState::Rejected(v)) =
            &self.kind
        {
            out.extend(v.as_object());
        }
    }
}

/// A finalizer released by a collection, waiting to run on the host thread
pub(crate) enum PendingFinalizer {
    Plain(Finalizer),
    Wrap(WrapFinalizer, Rc<dyn Any>),
}

impl PendingFinalizer {
    pub fn run(self, env: &Env) {
        match self {
            PendingFinalizer::Plain(f) => f(env),
            PendingFinalizer::Wrap(f, data) => f(env, data),
        }
    }
}

/// Garbage collector statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,
    /// Total objects freed across all collections
    pub objects_freed: usize,
    /// Objects freed in the last collection
    pub last_freed: usize,
    /// Live objects after the last collection
    pub live_objects: usize,
}

struct Slot {
    generation: u32,
    marked: bool,
    object: Option<HeapObject>,
}

/// The host heap
pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    global: ObjectId,
    stats: GcStats,
}

impl Heap {
    /// Create a heap holding only the global object
    pub fn new() -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            global: ObjectId {
                index: 0,
                generation: 0,
            },
            stats: GcStats::default(),
        };
        heap.global = heap.alloc(ObjectKind::Plain);
        heap
    }

    /// The global object (always a root)
    pub fn global(&self) -> ObjectId {
        self.global
    }

    /// Allocate a new object
    pub fn alloc(&mut self, kind: ObjectKind) -> ObjectId {
        let object = HeapObject::new(kind);
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            ObjectId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                marked: false,
                object: Some(object),
            });
            ObjectId {
                index,
                generation: 0,
            }
        }
    }

    /// Look up a live object
    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    /// Look up a live object mutably
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    /// Whether the object has not been reclaimed
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Attach a finalizer observer to an object
    pub fn add_finalizer(&mut self, id: ObjectId, finalizer: Finalizer) -> bool {
        match self.get_mut(id) {
            Some(object) => {
                object.finalizers.push(finalizer);
                true
            }
            None => false,
        }
    }

    /// Type tag of a value
    pub fn type_of(&self, value: &Value) -> ValueType {
        match value {
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Object(id) => match self.get(*id).map(|o| &o.kind) {
                Some(ObjectKind::Function { .. }) => ValueType::Function,
                Some(ObjectKind::External(_)) => ValueType::External,
                // A reclaimed object can only be observed through a weak
                // reference, which never hands it out.
                Some(_) | None => ValueType::Object,
            },
        }
    }

    /// Number of live objects
    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Collection statistics
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Mark from `roots` (plus the global object) and reclaim everything
    /// unreachable. Returns the finalizers of reclaimed objects.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Vec<PendingFinalizer> {
        let mut worklist: Vec<ObjectId> = roots.into_iter().collect();
        worklist.push(self.global);

        // Mark
        while let Some(id) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(id.index as usize) else {
                continue;
            };
            if slot.generation != id.generation || slot.marked {
                continue;
            }
            if let Some(object) = slot.object.as_ref() {
                slot.marked = true;
                object.children(&mut worklist);
            }
        }

        // Sweep
        let mut pending = Vec::new();
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.marked {
                slot.marked = false;
                continue;
            }
            if let Some(object) = slot.object.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                pending.extend(object.into_finalizers());
                freed += 1;
            }
        }

        self.live -= freed;
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.last_freed = freed;
        self.stats.live_objects = self.live;
        pending
    }

    /// Release every object and return all outstanding finalizers.
    /// Used at context teardown.
    pub fn drain(&mut self) -> Vec<PendingFinalizer> {
        let mut pending = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Some(object) = slot.object.take() {
                slot.generation = slot.generation.wrapping_add(1);
                pending.extend(object.into_finalizers());
            }
        }
        self.free.clear();
        self.slots.clear();
        self.live = 0;
        pending
    }
}
