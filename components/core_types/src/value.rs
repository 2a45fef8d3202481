//! Runtime value representation.
//!
//! `Value` is a closed enum. Immediate variants are stored inline; heap
//! variants are `Rc` handles, so cloning a value retains it and dropping a
//! value releases it.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{CodeUnit, Constant};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::error::{Exception, ExceptionKind};
use crate::object::{
    BoundMethod, Builtin, CellObj, Function, Generator, Instance, ListIter, Range, RangeIter,
    SeqIter, TypeObject,
};

/// Coarse runtime type used by specialization tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// `None`
    NoneType,
    /// `bool`
    Bool,
    /// `int` (machine or big)
    Int,
    /// `float`
    Float,
    /// `str`
    Str,
    /// `tuple`
    Tuple,
    /// `list`
    List,
    /// `range`
    Range,
    /// Range iterator
    RangeIterator,
    /// List iterator
    ListIterator,
    /// Tuple / string iterator
    SeqIterator,
    /// Instance of a user class
    Instance,
    /// User class
    Type,
    /// Function
    Function,
    /// Bound method
    Method,
    /// Native function
    Builtin,
    /// Code unit
    Code,
    /// Raised exception instance
    Exception,
    /// Built-in exception class
    ExceptionType,
    /// Closure cell
    Cell,
    /// Generator
    Generator,
}

impl TypeTag {
    /// Guest-visible type name
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::NoneType => "NoneType",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::Tuple => "tuple",
            TypeTag::List => "list",
            TypeTag::Range => "range",
            TypeTag::RangeIterator => "range_iterator",
            TypeTag::ListIterator => "list_iterator",
            TypeTag::SeqIterator => "iterator",
            TypeTag::Instance => "object",
            TypeTag::Type => "type",
            TypeTag::Function => "function",
            TypeTag::Method => "method",
            TypeTag::Builtin => "builtin_function_or_method",
            TypeTag::Code => "code",
            TypeTag::Exception => "exception",
            TypeTag::ExceptionType => "type",
            TypeTag::Cell => "cell",
            TypeTag::Generator => "generator",
        }
    }
}

/// Any runtime object
#[derive(Clone)]
pub enum Value {
    /// `None`
    None,
    /// Boolean
    Bool(bool),
    /// Machine integer
    Int(i64),
    /// Integer outside the machine range
    BigInt(Rc<BigInt>),
    /// IEEE 754 double
    Float(f64),
    /// Immutable string
    Str(Rc<str>),
    /// Immutable sequence
    Tuple(Rc<[Value]>),
    /// Mutable sequence
    List(Rc<RefCell<Vec<Value>>>),
    /// `range` object
    Range(Rc<Range>),
    /// Range iterator
    RangeIter(Rc<RangeIter>),
    /// List iterator
    ListIter(Rc<ListIter>),
    /// Tuple / string iterator
    SeqIter(Rc<SeqIter>),
    /// Instance of a user class
    Instance(Rc<Instance>),
    /// User class
    Type(Rc<TypeObject>),
    /// Function
    Function(Rc<Function>),
    /// Bound method
    BoundMethod(Rc<BoundMethod>),
    /// Native function
    Builtin(Rc<Builtin>),
    /// Code unit
    Code(Arc<CodeUnit>),
    /// Exception instance
    Exception(Rc<Exception>),
    /// Built-in exception class
    ExceptionType(ExceptionKind),
    /// Closure cell
    Cell(Rc<CellObj>),
    /// Generator
    Generator(Rc<Generator>),
}

impl Value {
    /// Materialize a compile-time constant
    pub fn from_constant(constant: &Constant) -> Value {
        match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::BigInt(b) => Value::from_bigint(b.clone()),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::Str(Rc::from(s.as_ref())),
            Constant::Tuple(items) => {
                Value::Tuple(items.iter().map(Value::from_constant).collect())
            }
            Constant::Code(code) => Value::Code(Arc::clone(code)),
        }
    }

    /// Convert back to a constant, for immutable values only
    pub fn to_constant(&self) -> Option<Constant> {
        Some(match self {
            Value::None => Constant::None,
            Value::Bool(b) => Constant::Bool(*b),
            Value::Int(i) => Constant::Int(*i),
            Value::BigInt(b) => Constant::BigInt(b.as_ref().clone()),
            Value::Float(f) => Constant::Float(*f),
            Value::Str(s) => Constant::Str(Arc::from(s.as_ref())),
            Value::Tuple(items) => Constant::Tuple(
                items
                    .iter()
                    .map(Value::to_constant)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Code(code) => Constant::Code(Arc::clone(code)),
            _ => return None,
        })
    }

    /// Normalize a big integer, demoting to `Int` when it fits
    pub fn from_bigint(value: BigInt) -> Value {
        match value.to_i64() {
            Some(small) => Value::Int(small),
            None => Value::BigInt(Rc::new(value)),
        }
    }

    /// String value
    pub fn str(text: &str) -> Value {
        Value::Str(Rc::from(text))
    }

    /// New list
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// New tuple
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    /// Coarse runtime type
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::None => TypeTag::NoneType,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) | Value::BigInt(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::List(_) => TypeTag::List,
            Value::Range(_) => TypeTag::Range,
            Value::RangeIter(_) => TypeTag::RangeIterator,
            Value::ListIter(_) => TypeTag::ListIterator,
            Value::SeqIter(_) => TypeTag::SeqIterator,
            Value::Instance(_) => TypeTag::Instance,
            Value::Type(_) => TypeTag::Type,
            Value::Function(_) => TypeTag::Function,
            Value::BoundMethod(_) => TypeTag::Method,
            Value::Builtin(_) => TypeTag::Builtin,
            Value::Code(_) => TypeTag::Code,
            Value::Exception(_) => TypeTag::Exception,
            Value::ExceptionType(_) => TypeTag::ExceptionType,
            Value::Cell(_) => TypeTag::Cell,
            Value::Generator(_) => TypeTag::Generator,
        }
    }

    /// Guest-visible type name (class name for instances)
    pub fn type_name(&self) -> String {
        match self {
            Value::Instance(obj) => obj.class().name().to_string(),
            Value::Exception(exc) => exc.kind().name().to_string(),
            other => other.type_tag().name().to_string(),
        }
    }

    /// Truth value
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::BigInt(b) => !b.is_zero(),
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    /// Identity comparison (`is`)
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Generator(a), Value::Generator(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `repr()` text
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Value::List(items) => {
                let inner: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            other => other.to_string(),
        }
    }
}

fn format_float(f: f64, out: &mut fmt::Formatter<'_>) -> fmt::Result {
    if f.is_nan() {
        write!(out, "nan")
    } else if f.is_infinite() {
        write!(out, "{}", if f > 0.0 { "inf" } else { "-inf" })
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        write!(out, "{:.1}", f)
    } else {
        write!(out, "{}", f)
    }
}

/// `str()` conversion
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::BigInt(b) => write!(f, "{}", b),
            Value::Float(x) => format_float(*x, f),
            Value::Str(s) => write!(f, "{}", s),
            Value::Tuple(_) | Value::List(_) => write!(f, "{}", self.repr()),
            Value::Range(r) => {
                if r.step == 1 {
                    write!(f, "range({}, {})", r.start, r.stop)
                } else {
                    write!(f, "range({}, {}, {})", r.start, r.stop, r.step)
                }
            }
            Value::RangeIter(_) => write!(f, "<range_iterator object>"),
            Value::ListIter(_) => write!(f, "<list_iterator object>"),
            Value::SeqIter(_) => write!(f, "<iterator object>"),
            Value::Instance(obj) => write!(f, "{:?}", obj),
            Value::Type(class) => write!(f, "<class '{}'>", class.name()),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::BoundMethod(m) => write!(f, "<bound method of {}>", m.receiver.repr()),
            Value::Builtin(b) => write!(f, "{:?}", b),
            Value::Code(code) => write!(f, "<code object {}>", code.qualname()),
            Value::Exception(exc) => write!(f, "{}", exc.message()),
            Value::ExceptionType(kind) => write!(f, "<class '{}'>", kind.name()),
            Value::Cell(_) => write!(f, "<cell>"),
            Value::Generator(g) => write!(f, "{:?}", g),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Structural equality for immutable values, identity for mutable ones
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            _ => self.is(other),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}
