//! Guest exceptions and engine-fatal errors.
//!
//! Guest exceptions are ordinary values raised by bytecode semantics and
//! caught through exception tables. Fatal errors abort the current
//! top-level call without running guest handlers.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::MalformedCodeError;
use thiserror::Error;

/// Built-in exception classes.
///
/// The hierarchy is fixed; [`ExceptionKind::parent`] gives the base class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Root of the hierarchy
    BaseException,
    /// Root of ordinary errors
    Exception,
    /// Arithmetic failures
    ArithmeticError,
    /// Division or modulo by zero
    ZeroDivisionError,
    /// Numeric result out of range
    OverflowError,
    /// Failed lookups
    LookupError,
    /// Sequence index out of range
    IndexError,
    /// Missing mapping key
    KeyError,
    /// Operation on an unsupported type
    TypeError,
    /// Right type, bad value
    ValueError,
    /// Unbound global name
    NameError,
    /// Local read before assignment
    UnboundLocalError,
    /// Missing attribute
    AttributeError,
    /// Iterator exhausted
    StopIteration,
    /// Generic runtime failure
    RuntimeError,
    /// Failed assertion
    AssertionError,
    /// Asynchronous interrupt delivered at the periodic tick
    KeyboardInterrupt,
}

impl ExceptionKind {
    /// Every built-in class
    pub const ALL: &'static [ExceptionKind] = &[
        ExceptionKind::BaseException,
        ExceptionKind::Exception,
        ExceptionKind::ArithmeticError,
        ExceptionKind::ZeroDivisionError,
        ExceptionKind::OverflowError,
        ExceptionKind::LookupError,
        ExceptionKind::IndexError,
        ExceptionKind::KeyError,
        ExceptionKind::TypeError,
        ExceptionKind::ValueError,
        ExceptionKind::NameError,
        ExceptionKind::UnboundLocalError,
        ExceptionKind::AttributeError,
        ExceptionKind::StopIteration,
        ExceptionKind::RuntimeError,
        ExceptionKind::AssertionError,
        ExceptionKind::KeyboardInterrupt,
    ];

    /// Class name
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::BaseException => "BaseException",
            ExceptionKind::Exception => "Exception",
            ExceptionKind::ArithmeticError => "ArithmeticError",
            ExceptionKind::ZeroDivisionError => "ZeroDivisionError",
            ExceptionKind::OverflowError => "OverflowError",
            ExceptionKind::LookupError => "LookupError",
            ExceptionKind::IndexError => "IndexError",
            ExceptionKind::KeyError => "KeyError",
            ExceptionKind::TypeError => "TypeError",
            ExceptionKind::ValueError => "ValueError",
            ExceptionKind::NameError => "NameError",
            ExceptionKind::UnboundLocalError => "UnboundLocalError",
            ExceptionKind::AttributeError => "AttributeError",
            ExceptionKind::StopIteration => "StopIteration",
            ExceptionKind::RuntimeError => "RuntimeError",
            ExceptionKind::AssertionError => "AssertionError",
            ExceptionKind::KeyboardInterrupt => "KeyboardInterrupt",
        }
    }

    /// Direct base class
    pub fn parent(self) -> Option<ExceptionKind> {
        use ExceptionKind::*;
        match self {
            BaseException => None,
            Exception | KeyboardInterrupt => Some(BaseException),
            ZeroDivisionError | OverflowError => Some(ArithmeticError),
            IndexError | KeyError => Some(LookupError),
            UnboundLocalError => Some(NameError),
            _ => Some(Exception),
        }
    }

    /// Whether `self` is `other` or derives from it
    pub fn is_subclass_of(self, other: ExceptionKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One unwound frame recorded on an exception
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    /// Qualified name of the code unit
    pub name: Arc<str>,
    /// Source file
    pub filename: Arc<str>,
    /// Line of the faulting instruction, if known
    pub line: Option<u32>,
}

/// A raised guest exception
#[derive(Debug)]
pub struct Exception {
    kind: ExceptionKind,
    message: String,
    traceback: RefCell<Vec<TracebackEntry>>,
}

impl Exception {
    /// Create an exception instance
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            kind,
            message: message.into(),
            traceback: RefCell::new(Vec::new()),
        })
    }

    /// Exception class
    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// Message text
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Append a frame; called once per frame the exception leaves
    pub fn push_traceback(&self, entry: TracebackEntry) {
        self.traceback.borrow_mut().push(entry);
    }

    /// Frames unwound so far, innermost first
    pub fn traceback(&self) -> Vec<TracebackEntry> {
        self.traceback.borrow().clone()
    }

    /// Traceback followed by the exception line, outermost frame first
    pub fn render(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for entry in self.traceback.borrow().iter().rev() {
            match entry.line {
                Some(line) => out.push_str(&format!(
                    "  File \"{}\", line {}, in {}\n",
                    entry.filename, line, entry.name
                )),
                None => out.push_str(&format!("  File \"{}\", in {}\n", entry.filename, entry.name)),
            }
        }
        out.push_str(&self.to_string());
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Engine-fatal failure of the current top-level call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// Frame depth exceeded the configured limit
    #[error("RecursionError: maximum recursion depth {0} exceeded")]
    RecursionLimit(usize),
    /// Nested run loops used up the native stack budget
    #[error("RecursionError: native stack budget of {0} bytes exhausted")]
    NativeStackExhausted(usize),
    /// Code failed validation
    #[error("malformed code: {0}")]
    Malformed(#[from] MalformedCodeError),
    /// Broken engine invariant
    #[error("internal error: {0}")]
    Internal(String),
}

/// Signal propagated out of a failing instruction
#[derive(Debug, Clone)]
pub enum Unwind {
    /// Guest exception, handled through exception tables
    Exception(Rc<Exception>),
    /// Fatal error, unwinds to the top-level call without running handlers
    Fatal(FatalError),
}

impl Unwind {
    /// Raise a fresh exception of `kind`
    pub fn raise(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Unwind::Exception(Exception::new(kind, message))
    }

    /// The guest exception, if this is one
    pub fn exception(&self) -> Option<&Rc<Exception>> {
        match self {
            Unwind::Exception(exc) => Some(exc),
            Unwind::Fatal(_) => None,
        }
    }
}

impl From<FatalError> for Unwind {
    fn from(err: FatalError) -> Self {
        Unwind::Fatal(err)
    }
}

impl From<Rc<Exception>> for Unwind {
    fn from(exc: Rc<Exception>) -> Self {
        Unwind::Exception(exc)
    }
}

impl fmt::Display for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unwind::Exception(exc) => write!(f, "{}", exc),
            Unwind::Fatal(err) => write!(f, "{}", err),
        }
    }
}

/// `TypeError` with `message`
pub fn type_error(message: impl Into<String>) -> Unwind {
    Unwind::raise(ExceptionKind::TypeError, message)
}

/// `ValueError` with `message`
pub fn value_error(message: impl Into<String>) -> Unwind {
    Unwind::raise(ExceptionKind::ValueError, message)
}
