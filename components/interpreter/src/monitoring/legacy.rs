//! Old-style profile and trace functions on top of the event hooks
//!
//! A profile function is called as `func(event, arg)` and a trace function
//! as `func(code, lineno, event, arg)`, with the classic event names. Both
//! are ordinary tools: the profiler claims [`PROFILER_ID`](super::PROFILER_ID)
//! and the tracer [`TRACER_ID`](super::TRACER_ID), so they conflict with any
//! other registrant of those slots.

use bytecode_system::CodeUnit;
use core_types::Value;

use super::{Event, EventSet, Payload};

/// Registrant name used for the profile slot
pub const PROFILE_REGISTRANT: &str = "sys.setprofile";
/// Registrant name used for the trace slot
pub const TRACE_REGISTRANT: &str = "sys.settrace";

/// Events the profile adapter listens for
pub fn profile_events() -> EventSet {
    EventSet::of(&[
        Event::PyStart,
        Event::PyResume,
        Event::PyThrow,
        Event::PyReturn,
        Event::PyYield,
        Event::PyUnwind,
        Event::Call,
        Event::CReturn,
        Event::CRaise,
    ])
}

/// Events the trace adapter listens for
pub fn trace_events(opcodes: bool) -> EventSet {
    let set = EventSet::of(&[
        Event::PyStart,
        Event::PyResume,
        Event::PyThrow,
        Event::PyReturn,
        Event::PyYield,
        Event::PyUnwind,
        Event::Raise,
        Event::StopIteration,
        Event::Line,
        Event::Jump,
        Event::Branch,
        Event::ExceptionHandled,
    ]);
    if opcodes {
        set.with(Event::Instruction)
    } else {
        set
    }
}

/// Installed legacy hook functions
#[derive(Debug, Clone, Default)]
pub struct LegacyHooks {
    /// Profile function
    pub profile: Option<Value>,
    /// Trace function
    pub trace: Option<Value>,
    /// Deliver `opcode` events to the trace function
    pub trace_opcodes: bool,
}

/// One invocation of the trace function
#[derive(Debug, Clone)]
pub struct TraceCall {
    /// `lineno` argument
    pub line: Option<u32>,
    /// Classic event name
    pub event: &'static str,
    /// `arg` argument
    pub arg: Value,
}

impl TraceCall {
    /// Positional arguments `(code, lineno, event, arg)`
    pub fn args(&self, code: &std::sync::Arc<CodeUnit>) -> Vec<Value> {
        vec![
            Value::Code(std::sync::Arc::clone(code)),
            self.line.map_or(Value::None, |l| Value::Int(l as i64)),
            Value::str(self.event),
            self.arg.clone(),
        ]
    }
}

fn exception_info(exc: &Value) -> Value {
    match exc {
        Value::Exception(e) => {
            Value::tuple(vec![Value::ExceptionType(e.kind()), exc.clone(), Value::None])
        }
        other => other.clone(),
    }
}

/// Whether `callable` runs as native code
pub(crate) fn is_native(callable: &Value) -> bool {
    match callable {
        Value::Builtin(_) => true,
        Value::BoundMethod(m) => matches!(m.function, Value::Builtin(_)),
        _ => false,
    }
}

/// Translate an event for the profile function: `(event, arg)`
pub fn profile_event(event: Event, payload: &Payload) -> Option<(&'static str, Value)> {
    match (event, payload) {
        (Event::PyStart | Event::PyResume | Event::PyThrow, _) => Some(("call", Value::None)),
        (Event::PyReturn | Event::PyYield, Payload::Return { value, .. }) => {
            Some(("return", value.clone()))
        }
        (Event::PyUnwind, _) => Some(("return", Value::None)),
        (Event::Call, Payload::Call { callable, .. }) if is_native(callable) => {
            Some(("c_call", callable.clone()))
        }
        (Event::CReturn, Payload::Call { callable, .. }) => Some(("c_return", callable.clone())),
        (Event::CRaise, Payload::Call { callable, .. }) => Some(("c_exception", callable.clone())),
        _ => None,
    }
}

fn line_event(line: Option<u32>, last_traced_line: &mut Option<u32>) -> TraceCall {
    *last_traced_line = line;
    TraceCall {
        line,
        event: "line",
        arg: Value::None,
    }
}

/// Translate an event for the trace function
///
/// `last_traced_line` is the frame's record of the last `line` event
/// delivered; it suppresses repeats and is updated by every line event,
/// including the ones synthesized for jumps and handled exceptions.
pub fn trace_event(
    event: Event,
    payload: &Payload,
    code: &CodeUnit,
    last_traced_line: &mut Option<u32>,
    trace_opcodes: bool,
) -> Option<TraceCall> {
    let line = payload.line(code);
    let call = |event: &'static str, arg: Value| TraceCall { line, event, arg };
    match (event, payload) {
        (Event::PyStart | Event::PyResume | Event::PyThrow, _) => Some(call("call", Value::None)),
        (Event::PyReturn | Event::PyYield, Payload::Return { value, .. }) => {
            Some(call("return", value.clone()))
        }
        (Event::PyUnwind, _) => Some(call("return", Value::None)),
        (Event::Raise | Event::StopIteration, Payload::Exception { exc, .. }) => {
            Some(call("exception", exception_info(exc)))
        }
        (Event::Line, _) => {
            if line.is_none() || line == *last_traced_line {
                return None;
            }
            Some(line_event(line, last_traced_line))
        }
        (Event::Jump | Event::Branch, Payload::Jump { from, to }) => {
            // Backward jumps always report; forward ones only on a new line.
            if to > from && line == *last_traced_line {
                return None;
            }
            line.map(|_| line_event(line, last_traced_line))
        }
        (Event::ExceptionHandled, _) => {
            if line.is_none() || line == *last_traced_line {
                return None;
            }
            Some(line_event(line, last_traced_line))
        }
        (Event::Instruction, _) if trace_opcodes => Some(call("opcode", Value::None)),
        _ => None,
    }
}
