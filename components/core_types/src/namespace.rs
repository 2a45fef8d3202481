//! Module globals and builtins namespaces.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::VersionTag;
use indexmap::IndexMap;

use crate::value::Value;

/// Ordered name → value mapping with a keys version.
///
/// The keys version changes whenever a key is added or removed, which is
/// what invalidates cached entry indices. Rebinding an existing key keeps
/// both the version and the entry index, so cached lookups observe the new
/// value without deoptimizing.
#[derive(Debug, Default)]
pub struct Namespace {
    entries: RefCell<IndexMap<Rc<str>, Value>>,
    keys_version: Arc<VersionTag>,
}

impl Namespace {
    /// Create an empty namespace
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Look up `name`
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.borrow().get(name).cloned()
    }

    /// Entry position of `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.borrow().get_index_of(name)
    }

    /// Value at entry position `index`
    pub fn get_index(&self, index: usize) -> Option<Value> {
        self.entries
            .borrow()
            .get_index(index)
            .map(|(_, value)| value.clone())
    }

    /// Bind `name`, bumping the keys version if the key is new
    pub fn insert(&self, name: &str, value: Value) {
        let mut entries = self.entries.borrow_mut();
        if let Some(slot) = entries.get_mut(name) {
            *slot = value;
            return;
        }
        self.keys_version.bump();
        entries.insert(Rc::from(name), value);
    }

    /// Unbind `name`
    pub fn remove(&self, name: &str) -> Option<Value> {
        let mut entries = self.entries.borrow_mut();
        if !entries.contains_key(name) {
            return None;
        }
        self.keys_version.bump();
        entries.shift_remove(name)
    }

    /// Whether `name` is bound
    pub fn contains(&self, name: &str) -> bool {
        self.entries.borrow().contains_key(name)
    }

    /// Bound names in insertion order
    pub fn keys(&self) -> Vec<Rc<str>> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Current keys version
    pub fn keys_version(&self) -> u32 {
        self.keys_version.get()
    }

    /// Shared keys version tag
    pub fn version_tag(&self) -> &Arc<VersionTag> {
        &self.keys_version
    }
}
