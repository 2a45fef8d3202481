//! Object ownership facade.
//!
//! The engine never frees memory directly. Holding a [`Value`] is holding an
//! owning reference; these functions name the retain/release pairing the
//! engine relies on so call sites read as what they are.

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::VersionTag;

use crate::namespace::Namespace;
use crate::object::TypeObject;
use crate::value::{TypeTag, Value};

/// Entities whose shape is guarded by a version tag
pub trait Versioned {
    /// The entity's tag
    fn version_tag(&self) -> &Arc<VersionTag>;
}

impl Versioned for TypeObject {
    fn version_tag(&self) -> &Arc<VersionTag> {
        TypeObject::version_tag(self)
    }
}

impl Versioned for Namespace {
    fn version_tag(&self) -> &Arc<VersionTag> {
        Namespace::version_tag(self)
    }
}

/// Take an additional owning reference
#[inline]
pub fn retain(value: &Value) -> Value {
    value.clone()
}

/// Give up an owning reference
#[inline]
pub fn release(value: Value) {
    drop(value);
}

/// Runtime type of `value`
#[inline]
pub fn type_of(value: &Value) -> TypeTag {
    value.type_tag()
}

/// Current version of a type or namespace
#[inline]
pub fn version_tag_of(entity: &dyn Versioned) -> u32 {
    entity.version_tag().get()
}

/// Strong reference count of a heap value; `None` for immediates
pub fn ref_count(value: &Value) -> Option<usize> {
    Some(match value {
        Value::BigInt(v) => Rc::strong_count(v),
        Value::Str(v) => Rc::strong_count(v),
        Value::Tuple(v) => Rc::strong_count(v),
        Value::List(v) => Rc::strong_count(v),
        Value::Range(v) => Rc::strong_count(v),
        Value::RangeIter(v) => Rc::strong_count(v),
        Value::ListIter(v) => Rc::strong_count(v),
        Value::SeqIter(v) => Rc::strong_count(v),
        Value::Instance(v) => Rc::strong_count(v),
        Value::Type(v) => Rc::strong_count(v),
        Value::Function(v) => Rc::strong_count(v),
        Value::BoundMethod(v) => Rc::strong_count(v),
        Value::Builtin(v) => Rc::strong_count(v),
        Value::Code(v) => Arc::strong_count(v),
        Value::Exception(v) => Rc::strong_count(v),
        Value::Cell(v) => Rc::strong_count(v),
        Value::Generator(v) => Rc::strong_count(v),
        Value::None
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::ExceptionType(_) => return None,
    })
}
