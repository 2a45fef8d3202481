//! Object model facade for the execution engine.
//!
//! This crate provides the runtime values the interpreter operates on and
//! the small ownership interface it relies on. Memory management is plain
//! reference counting: holding a [`Value`] is holding an owning reference.
//!
//! # Overview
//!
//! - [`Value`] - Closed enum of every runtime object
//! - [`TypeObject`], [`Instance`] - User classes with versioned layouts
//! - [`Namespace`] - Module globals and builtins with a keys version
//! - [`ownership`] - `retain` / `release` / `type_of` / `version_tag_of`
//! - [`Exception`], [`Unwind`], [`FatalError`] - Guest and engine failures
//!
//! # Examples
//!
//! ```
//! use core_types::{Instance, TypeObject, Value};
//!
//! let point = TypeObject::new("Point");
//! let p = Instance::new(&point);
//! let before = point.version();
//! p.set_attr("x", Value::Int(3));
//!
//! // Adding a layout slot changes the type's shape
//! assert_ne!(point.version(), before);
//! assert_eq!(p.get_attr("x"), Some(Value::Int(3)));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod interp;
mod namespace;
mod object;
pub mod ownership;
mod value;

pub use error::{
    type_error, value_error, Exception, ExceptionKind, FatalError, TracebackEntry, Unwind,
};
pub use interp::Interp;
pub use namespace::Namespace;
pub use object::{
    BoundMethod, Builtin, BuiltinFn, CellObj, Function, Generator, Instance, ListIter, Range,
    RangeIter, SeqIter, TypeObject,
};
pub use ownership::Versioned;
pub use value::{TypeTag, Value};
