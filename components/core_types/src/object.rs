//! Heap objects behind [`Value`] handles.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{next_version, CodeUnit, VersionTag};
use indexmap::IndexMap;

use crate::error::Unwind;
use crate::interp::Interp;
use crate::namespace::Namespace;
use crate::value::Value;

/// A user-defined class.
///
/// Instances of one class share an attribute layout (name → slot index).
/// The version tag changes whenever a class attribute is set or deleted and
/// whenever the layout gains a name, so a cached `(version, slot)` pair is
/// valid exactly while the version matches.
pub struct TypeObject {
    name: Rc<str>,
    attrs: RefCell<IndexMap<Rc<str>, Value>>,
    layout: RefCell<IndexMap<Rc<str>, ()>>,
    version: Arc<VersionTag>,
    live_instances: Cell<usize>,
}

impl TypeObject {
    /// Create an empty class
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: Rc::from(name),
            attrs: RefCell::new(IndexMap::new()),
            layout: RefCell::new(IndexMap::new()),
            version: Arc::new(VersionTag::new()),
            live_instances: Cell::new(0),
        })
    }

    /// Class name
    pub fn name(&self) -> &Rc<str> {
        &self.name
    }

    /// Class attribute lookup
    pub fn class_attr(&self, name: &str) -> Option<Value> {
        self.attrs.borrow().get(name).cloned()
    }

    /// Set a class attribute
    pub fn set_class_attr(&self, name: &str, value: Value) {
        self.version.bump();
        self.attrs.borrow_mut().insert(Rc::from(name), value);
    }

    /// Delete a class attribute
    pub fn del_class_attr(&self, name: &str) -> Option<Value> {
        self.version.bump();
        self.attrs.borrow_mut().shift_remove(name)
    }

    /// Layout slot of instance attribute `name`
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.layout.borrow().get_index_of(name)
    }

    /// Layout slot of `name`, extending the layout if needed
    pub fn ensure_slot(&self, name: &str) -> usize {
        if let Some(index) = self.slot_of(name) {
            return index;
        }
        self.version.bump();
        let mut layout = self.layout.borrow_mut();
        layout.insert(Rc::from(name), ());
        layout.len() - 1
    }

    /// Number of layout slots
    pub fn layout_len(&self) -> usize {
        self.layout.borrow().len()
    }

    /// Current version
    pub fn version(&self) -> u32 {
        self.version.get()
    }

    /// Shared version tag
    pub fn version_tag(&self) -> &Arc<VersionTag> {
        &self.version
    }

    /// Instances of this class currently alive
    pub fn live_instances(&self) -> usize {
        self.live_instances.get()
    }
}

impl fmt::Debug for TypeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeObject")
            .field("name", &self.name)
            .field("version", &self.version.get())
            .finish()
    }
}

/// Instance of a user-defined class
pub struct Instance {
    class: Rc<TypeObject>,
    slots: RefCell<Vec<Option<Value>>>,
}

impl Instance {
    /// Allocate an instance with no attributes set
    pub fn new(class: &Rc<TypeObject>) -> Rc<Self> {
        class.live_instances.set(class.live_instances.get() + 1);
        Rc::new(Self {
            class: Rc::clone(class),
            slots: RefCell::new(Vec::new()),
        })
    }

    /// The instance's class
    pub fn class(&self) -> &Rc<TypeObject> {
        &self.class
    }

    /// Value in layout slot `index`
    pub fn slot(&self, index: usize) -> Option<Value> {
        self.slots.borrow().get(index).cloned().flatten()
    }

    /// Whether layout slot `index` holds a value
    pub fn has_slot(&self, index: usize) -> bool {
        matches!(self.slots.borrow().get(index), Some(Some(_)))
    }

    /// Write layout slot `index`, returning the previous value
    pub fn set_slot(&self, index: usize, value: Value) -> Option<Value> {
        let mut slots = self.slots.borrow_mut();
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        slots[index].replace(value)
    }

    /// Attribute lookup: instance slots first, then the class
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.class
            .slot_of(name)
            .and_then(|index| self.slot(index))
            .or_else(|| self.class.class_attr(name))
    }

    /// Attribute assignment through the shared layout
    pub fn set_attr(&self, name: &str, value: Value) {
        let index = self.class.ensure_slot(name);
        self.set_slot(index, value);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let live = self.class.live_instances.get();
        self.class.live_instances.set(live.saturating_sub(1));
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.class.name)
    }
}

/// Function object: code plus the environment it closes over
pub struct Function {
    name: Rc<str>,
    code: Arc<CodeUnit>,
    globals: Rc<Namespace>,
    builtins: Rc<Namespace>,
    closure: Vec<Rc<CellObj>>,
    version: u32,
}

impl Function {
    /// Create a function with a fresh version
    pub fn new(
        code: Arc<CodeUnit>,
        globals: Rc<Namespace>,
        builtins: Rc<Namespace>,
        closure: Vec<Rc<CellObj>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: Rc::from(code.qualname().as_ref()),
            code,
            globals,
            builtins,
            closure,
            version: next_version(),
        })
    }

    /// Qualified name
    pub fn name(&self) -> &Rc<str> {
        &self.name
    }

    /// Code unit
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    /// Module namespace
    pub fn globals(&self) -> &Rc<Namespace> {
        &self.globals
    }

    /// Builtins namespace
    pub fn builtins(&self) -> &Rc<Namespace> {
        &self.builtins
    }

    /// Captured cells, in free-variable order
    pub fn closure(&self) -> &[Rc<CellObj>] {
        &self.closure
    }

    /// Identity version used by call-site caches
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// Shared mutable slot backing cell and free variables
#[derive(Debug, Default)]
pub struct CellObj {
    value: RefCell<Option<Value>>,
}

impl CellObj {
    /// Create a cell, optionally pre-filled
    pub fn new(value: Option<Value>) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(value),
        })
    }

    /// Current contents
    pub fn get(&self) -> Option<Value> {
        self.value.borrow().clone()
    }

    /// Replace the contents
    pub fn set(&self, value: Value) {
        *self.value.borrow_mut() = Some(value);
    }
}

/// Function bound to a receiver
#[derive(Debug)]
pub struct BoundMethod {
    /// Prepended as the first argument
    pub receiver: Value,
    /// Underlying callable
    pub function: Value,
}

/// Native function signature
pub type BuiltinFn = fn(&mut dyn Interp, &[Value]) -> Result<Value, Unwind>;

/// Natively implemented callable
pub struct Builtin {
    name: &'static str,
    func: BuiltinFn,
}

impl Builtin {
    /// Wrap a native function
    pub fn new(name: &'static str, func: BuiltinFn) -> Rc<Self> {
        Rc::new(Self { name, func })
    }

    /// Name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invoke with positional arguments
    pub fn call(&self, interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
        (self.func)(interp, args)
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// Generator object owning a suspended frame.
///
/// The frame is stored type-erased because frames belong to the
/// interpreter. While the generator runs its frame is taken out, so a
/// second resumption finds the slot empty.
pub struct Generator {
    name: Rc<str>,
    frame: RefCell<Option<Box<dyn Any>>>,
    finished: Cell<bool>,
}

impl Generator {
    /// Wrap a freshly created frame
    pub fn new(name: &str, frame: Box<dyn Any>) -> Rc<Self> {
        Rc::new(Self {
            name: Rc::from(name),
            frame: RefCell::new(Some(frame)),
            finished: Cell::new(false),
        })
    }

    /// Generator name
    pub fn name(&self) -> &Rc<str> {
        &self.name
    }

    /// Take the suspended frame for resumption
    pub fn take_frame(&self) -> Option<Box<dyn Any>> {
        self.frame.borrow_mut().take()
    }

    /// Put the frame back after a yield
    pub fn suspend(&self, frame: Box<dyn Any>) {
        *self.frame.borrow_mut() = Some(frame);
    }

    /// Mark completed; the frame is dropped
    pub fn finish(&self) {
        self.finished.set(true);
        self.frame.borrow_mut().take();
    }

    /// Whether the generator returned or raised
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Whether the frame is currently executing
    pub fn is_running(&self) -> bool {
        !self.finished.get() && self.frame.borrow().is_none()
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<generator object {}>", self.name)
    }
}

/// Arithmetic progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// First value
    pub start: i64,
    /// Exclusive bound
    pub stop: i64,
    /// Non-zero increment
    pub step: i64,
}

impl Range {
    /// Number of items
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            (self.stop as i128 - self.start as i128 + self.step as i128 - 1) / self.step as i128
        } else {
            (self.start as i128 - self.stop as i128 - self.step as i128 - 1) / (-(self.step as i128))
        };
        span.max(0) as usize
    }

    /// Whether the range is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh iterator
    pub fn iter(&self) -> RangeIter {
        RangeIter {
            next: Cell::new(self.start),
            stop: self.stop,
            step: self.step,
        }
    }
}

/// Iterator over a [`Range`]
#[derive(Debug)]
pub struct RangeIter {
    next: Cell<i64>,
    stop: i64,
    step: i64,
}

impl RangeIter {
    /// Whether no items remain
    pub fn is_exhausted(&self) -> bool {
        let next = self.next.get();
        if self.step > 0 {
            next >= self.stop
        } else {
            next <= self.stop
        }
    }

    /// Advance
    pub fn next_value(&self) -> Option<i64> {
        if self.is_exhausted() {
            return None;
        }
        let value = self.next.get();
        // Past-the-end saturates; exhaustion is decided by the comparison above.
        self.next.set(value.saturating_add(self.step));
        Some(value)
    }
}

/// Iterator over a list, observing mutation during iteration
#[derive(Debug)]
pub struct ListIter {
    list: Rc<RefCell<Vec<Value>>>,
    index: Cell<usize>,
}

impl ListIter {
    /// Start iterating `list`
    pub fn new(list: Rc<RefCell<Vec<Value>>>) -> Self {
        Self {
            list,
            index: Cell::new(0),
        }
    }

    /// Whether no items remain
    pub fn is_exhausted(&self) -> bool {
        self.index.get() >= self.list.borrow().len()
    }

    /// Advance
    pub fn next_value(&self) -> Option<Value> {
        let index = self.index.get();
        let item = self.list.borrow().get(index).cloned()?;
        self.index.set(index + 1);
        Some(item)
    }
}

/// Iterator over an immutable sequence (tuples, string characters)
#[derive(Debug)]
pub struct SeqIter {
    items: Rc<[Value]>,
    index: Cell<usize>,
}

impl SeqIter {
    /// Start iterating `items`
    pub fn new(items: Rc<[Value]>) -> Self {
        Self {
            items,
            index: Cell::new(0),
        }
    }

    /// Advance
    pub fn next_value(&self) -> Option<Value> {
        let index = self.index.get();
        let item = self.items.get(index).cloned()?;
        self.index.set(index + 1);
        Some(item)
    }
}
