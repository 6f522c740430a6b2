//! Refcounted references
//!
//! A [`Reference`] outlives every scope. While its count is above zero it
//! roots its value; at zero it becomes weak, and the value may be reclaimed
//! by the next collection. The bookkeeping itself is only freed by
//! [`Env::delete_reference`].

use crate::bridge::scope::Handle;
use crate::bridge::Env;
use crate::host::heap::{ObjectId, Value};
use ferrule_sdk::{BridgeError, BridgeResult, ReferenceId};
use rustc_hash::FxHashMap;
use std::marker::PhantomData;

/// Explicit refcounted reference to a host value
#[derive(Debug)]
#[must_use = "references must be deleted explicitly"]
pub struct Reference {
    id: ReferenceId,
    _host_thread: PhantomData<*const ()>,
}

impl Reference {
    /// Registry key of this reference
    pub fn id(&self) -> ReferenceId {
        self.id
    }
}

struct RefEntry {
    value: Value,
    count: u32,
}

/// All live references of one context
pub(crate) struct ReferenceTable {
    entries: FxHashMap<ReferenceId, RefEntry>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    fn entry_mut(&mut self, id: ReferenceId) -> &mut RefEntry {
        match self.entries.get_mut(&id) {
            Some(entry) => entry,
            None => panic!("{} used after delete", id),
        }
    }

    fn entry(&self, id: ReferenceId) -> &RefEntry {
        match self.entries.get(&id) {
            Some(entry) => entry,
            None => panic!("{} used after delete", id),
        }
    }

    /// Value a reference was created with
    pub fn value_of(&self, id: ReferenceId) -> Value {
        self.entry(id).value.clone()
    }

    /// Objects held by references with a non-zero count
    pub fn roots(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries
            .values()
            .filter(|entry| entry.count > 0)
            .filter_map(|entry| entry.value.as_object())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Env {
    /// Create a reference to `value` with an initial count
    pub fn create_reference(&self, value: Handle, initial_count: u32) -> Reference {
        let value = self.value(value);
        let id = ReferenceId::new();
        self.references.borrow_mut().entries.insert(
            id,
            RefEntry {
                value,
                count: initial_count,
            },
        );
        Reference {
            id,
            _host_thread: PhantomData,
        }
    }

    /// Increment the count, returning the new count
    pub fn reference_ref(&self, reference: &Reference) -> u32 {
        let mut table = self.references.borrow_mut();
        let entry = table.entry_mut(reference.id);
        entry.count += 1;
        entry.count
    }

    /// Decrement the count, returning the new count.
    ///
    /// Fails with `InvalidArg` if the count is already zero.
    pub fn reference_unref(&self, reference: &Reference) -> BridgeResult<u32> {
        let mut table = self.references.borrow_mut();
        let entry = table.entry_mut(reference.id);
        if entry.count == 0 {
            return Err(BridgeError::InvalidArg(format!(
                "{} already has a count of zero",
                reference.id
            )));
        }
        entry.count -= 1;
        Ok(entry.count)
    }

    /// Current count
    pub fn reference_count(&self, reference: &Reference) -> u32 {
        self.references.borrow().entry(reference.id).count
    }

    /// The referenced value, or `None` once the host has reclaimed it.
    ///
    /// Never `None` while the count is above zero. Primitive values are
    /// never reclaimed.
    pub fn get_reference_value(&self, reference: &Reference) -> Option<Handle> {
        let value = self.references.borrow().value_of(reference.id);
        if let Some(id) = value.as_object() {
            if !self.heap.borrow().is_live(id) {
                return None;
            }
        }
        Some(self.handle(value))
    }

    /// Free the reference's bookkeeping, whatever its count
    pub fn delete_reference(&self, reference: Reference) {
        if self.references.borrow_mut().entries.remove(&reference.id).is_none() {
            panic!("{} deleted twice or from another context", reference.id);
        }
    }

    /// Number of undeleted references
    pub fn reference_table_len(&self) -> usize {
        self.references.borrow().len()
    }
}
