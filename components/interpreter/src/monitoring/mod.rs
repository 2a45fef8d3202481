//! Event hook dispatch for debuggers, profilers and coverage tools
//!
//! Up to eight tools can register callbacks for execution events. The
//! union of every tool's event set is kept as a single global mask, and a
//! version tag moves whenever the mask changes. Tier-2 executors depend on
//! that tag, so turning on any event invalidates them lazily.

pub mod legacy;

use std::sync::Arc;

use arrayvec::ArrayVec;
use bytecode_system::{CodeUnit, VersionTag};
use core_types::Value;
use tracing::debug;

use crate::error::MonitoringError;

/// Number of tool slots
pub const TOOL_COUNT: usize = 8;
/// Conventional id for debuggers
pub const DEBUGGER_ID: u8 = 0;
/// Conventional id for coverage tools
pub const COVERAGE_ID: u8 = 1;
/// Slot used by the legacy profile hook
pub const PROFILER_ID: u8 = 6;
/// Slot used by the legacy trace hook
pub const TRACER_ID: u8 = 7;

const EVENT_COUNT: usize = 17;

macro_rules! define_events {
    ($( $(#[$meta:meta])* $variant:ident = $bit:literal => $name:literal, )*) => {
        /// Execution events a tool can subscribe to
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Event {
            $( $(#[$meta])* $variant = $bit, )*
        }

        impl Event {
            /// Every event, in bit order
            pub const ALL: &'static [Event] = &[$( Event::$variant, )*];

            /// Canonical upper-case name
            pub fn name(self) -> &'static str {
                match self {
                    $( Event::$variant => $name, )*
                }
            }
        }
    };
}

define_events! {
    /// A frame starts executing
    PyStart = 0 => "PY_START",
    /// A suspended generator frame resumes
    PyResume = 1 => "PY_RESUME",
    /// A frame returns
    PyReturn = 2 => "PY_RETURN",
    /// A generator frame yields
    PyYield = 3 => "PY_YIELD",
    /// A call is about to happen
    Call = 4 => "CALL",
    /// Execution reaches a new source line
    Line = 5 => "LINE",
    /// Every instruction
    Instruction = 6 => "INSTRUCTION",
    /// An unconditional jump
    Jump = 7 => "JUMP",
    /// A conditional branch
    Branch = 8 => "BRANCH",
    /// An iterator was exhausted
    StopIteration = 9 => "STOP_ITERATION",
    /// An exception is raised
    Raise = 10 => "RAISE",
    /// An exception is caught by a handler
    ExceptionHandled = 11 => "EXCEPTION_HANDLED",
    /// A frame exits through an exception
    PyUnwind = 12 => "PY_UNWIND",
    /// An exception is thrown into a generator
    PyThrow = 13 => "PY_THROW",
    /// An exception is re-raised
    Reraise = 14 => "RERAISE",
    /// A native callable returned
    CReturn = 15 => "C_RETURN",
    /// A native callable raised
    CRaise = 16 => "C_RAISE",
}

impl Event {
    #[inline]
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of events, one bit per [`Event`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventSet(u32);

impl EventSet {
    /// No events
    pub const EMPTY: EventSet = EventSet(0);

    /// Set containing exactly `events`
    pub fn of(events: &[Event]) -> Self {
        events.iter().copied().collect()
    }

    /// Every event
    pub fn all() -> Self {
        Self::of(Event::ALL)
    }

    /// Raw bitmask
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether `event` is in the set
    #[inline]
    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    /// Copy with `event` added
    pub fn with(self, event: Event) -> Self {
        EventSet(self.0 | event.bit())
    }

    /// Copy with `event` removed
    pub fn without(self, event: Event) -> Self {
        EventSet(self.0 & !event.bit())
    }

    /// Whether the set is empty
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Events in the set, in bit order
    pub fn iter(self) -> impl Iterator<Item = Event> {
        Event::ALL.iter().copied().filter(move |e| self.contains(*e))
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        iter.into_iter().fold(EventSet::EMPTY, EventSet::with)
    }
}

/// What runs when an event fires for a tool
#[derive(Debug, Clone)]
pub enum Handler {
    /// A guest callable invoked with the event's positional arguments
    Object(Value),
    /// Adapter feeding the installed profile function
    LegacyProfile,
    /// Adapter feeding the installed trace function
    LegacyTrace,
}

/// Arguments describing one event occurrence
///
/// Offsets are instruction indices into the code unit.
#[derive(Debug, Clone)]
pub enum Payload {
    /// `(code, offset)`
    At {
        /// Instruction index
        offset: usize,
    },
    /// `(code, offset, value)` for returns and yields
    Return {
        /// Instruction index
        offset: usize,
        /// Returned or yielded value
        value: Value,
    },
    /// `(code, offset, callable, arg0)`
    Call {
        /// Instruction index
        offset: usize,
        /// The callee
        callable: Value,
        /// First argument, or a missing-argument marker
        arg0: Value,
    },
    /// `(code, line)`
    Line {
        /// New source line
        line: u32,
    },
    /// `(code, from, to)`
    Jump {
        /// Index of the jumping instruction
        from: usize,
        /// Destination index
        to: usize,
    },
    /// `(code, offset, exception)`
    Exception {
        /// Instruction index
        offset: usize,
        /// The exception object
        exc: Value,
    },
}

impl Payload {
    /// Positional arguments passed to a tool callback
    pub fn args(&self, code: &Arc<CodeUnit>) -> Vec<Value> {
        let code = Value::Code(Arc::clone(code));
        let int = |n: usize| Value::Int(n as i64);
        match self {
            Payload::At { offset } => vec![code, int(*offset)],
            Payload::Return { offset, value } => vec![code, int(*offset), value.clone()],
            Payload::Call {
                offset,
                callable,
                arg0,
            } => vec![code, int(*offset), callable.clone(), arg0.clone()],
            Payload::Line { line } => vec![code, Value::Int(*line as i64)],
            Payload::Jump { from, to } => vec![code, int(*from), int(*to)],
            Payload::Exception { offset, exc } => vec![code, int(*offset), exc.clone()],
        }
    }

    /// Source line the event happened on
    pub fn line(&self, code: &CodeUnit) -> Option<u32> {
        match self {
            Payload::Line { line } => Some(*line),
            Payload::Jump { to, .. } => code.line_for(*to),
            Payload::At { offset }
            | Payload::Return { offset, .. }
            | Payload::Call { offset, .. }
            | Payload::Exception { offset, .. } => code.line_for(*offset),
        }
    }
}

#[derive(Debug, Clone)]
struct Tool {
    name: String,
    events: EventSet,
    callbacks: [Option<Handler>; EVENT_COUNT],
}

impl Tool {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: EventSet::EMPTY,
            callbacks: Default::default(),
        }
    }
}

/// Tool registry and global event mask of one interpreter
#[derive(Debug)]
pub struct Monitoring {
    tools: [Option<Tool>; TOOL_COUNT],
    mask: EventSet,
    tag: Arc<VersionTag>,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(tool: u8) -> Result<usize, MonitoringError> {
    if (tool as usize) < TOOL_COUNT {
        Ok(tool as usize)
    } else {
        Err(MonitoringError::InvalidTool(tool))
    }
}

impl Monitoring {
    /// Registry with no tools
    pub fn new() -> Self {
        Self {
            tools: Default::default(),
            mask: EventSet::EMPTY,
            tag: Arc::new(VersionTag::new()),
        }
    }

    /// Claim `tool` for `name`
    pub fn use_tool_id(&mut self, tool: u8, name: &str) -> Result<(), MonitoringError> {
        let index = slot(tool)?;
        if let Some(holder) = &self.tools[index] {
            return Err(MonitoringError::Conflict {
                tool,
                holder: holder.name.clone(),
            });
        }
        debug!(tool, name, "tool claimed");
        self.tools[index] = Some(Tool::new(name));
        Ok(())
    }

    /// Release `tool`, dropping its events and callbacks
    pub fn free_tool_id(&mut self, tool: u8) -> Result<(), MonitoringError> {
        let index = slot(tool)?;
        if self.tools[index].take().is_some() {
            debug!(tool, "tool freed");
            self.recompute_mask();
        }
        Ok(())
    }

    /// Name of the registrant holding `tool`
    pub fn get_tool(&self, tool: u8) -> Option<&str> {
        let index = slot(tool).ok()?;
        self.tools[index].as_ref().map(|t| t.name.as_str())
    }

    /// Claim `tool` for `registrant` (or reuse its existing claim), then
    /// install `handler` for every event in `events` and enable them
    ///
    /// Fails with a conflict when a different registrant holds the slot.
    pub fn register(
        &mut self,
        tool: u8,
        registrant: &str,
        events: EventSet,
        handler: Handler,
    ) -> Result<(), MonitoringError> {
        let index = slot(tool)?;
        match &self.tools[index] {
            Some(holder) if holder.name != registrant => {
                return Err(MonitoringError::Conflict {
                    tool,
                    holder: holder.name.clone(),
                });
            }
            Some(_) => {}
            None => self.use_tool_id(tool, registrant)?,
        }
        if let Some(state) = self.tools[index].as_mut() {
            for event in events.iter() {
                state.callbacks[event as usize] = Some(handler.clone());
            }
        }
        self.set_events(tool, events)
    }

    /// Install (or with `None`, remove) the callable for `event`
    ///
    /// Returns the previously installed callable.
    pub fn register_callback(
        &mut self,
        tool: u8,
        event: Event,
        callback: Option<Value>,
    ) -> Result<Option<Value>, MonitoringError> {
        let index = slot(tool)?;
        let state = self.tools[index]
            .as_mut()
            .ok_or(MonitoringError::ToolNotInUse(tool))?;
        let previous = std::mem::replace(
            &mut state.callbacks[event as usize],
            callback.map(Handler::Object),
        );
        Ok(match previous {
            Some(Handler::Object(value)) => Some(value),
            _ => None,
        })
    }

    /// Replace the event set of `tool`
    pub fn set_events(&mut self, tool: u8, events: EventSet) -> Result<(), MonitoringError> {
        let index = slot(tool)?;
        let state = self.tools[index]
            .as_mut()
            .ok_or(MonitoringError::ToolNotInUse(tool))?;
        state.events = events;
        self.recompute_mask();
        Ok(())
    }

    /// Event set of `tool`
    pub fn get_events(&self, tool: u8) -> Result<EventSet, MonitoringError> {
        let index = slot(tool)?;
        self.tools[index]
            .as_ref()
            .map(|t| t.events)
            .ok_or(MonitoringError::ToolNotInUse(tool))
    }

    /// Union of every tool's events
    #[inline]
    pub fn mask(&self) -> EventSet {
        self.mask
    }

    /// Whether some tool listens for `event`
    #[inline]
    pub fn is_active(&self, event: Event) -> bool {
        self.mask.contains(event)
    }

    /// Whether any event at all is enabled
    #[inline]
    pub fn any_active(&self) -> bool {
        !self.mask.is_empty()
    }

    /// Tag moved on every change of the global mask
    pub fn instrumentation_tag(&self) -> &Arc<VersionTag> {
        &self.tag
    }

    /// Handlers for `event`, in tool-id order
    pub fn handlers(&self, event: Event) -> ArrayVec<(u8, Handler), TOOL_COUNT> {
        let mut out = ArrayVec::new();
        if !self.mask.contains(event) {
            return out;
        }
        for (id, tool) in self.tools.iter().enumerate() {
            let Some(tool) = tool else { continue };
            if !tool.events.contains(event) {
                continue;
            }
            if let Some(handler) = &tool.callbacks[event as usize] {
                out.push((id as u8, handler.clone()));
            }
        }
        out
    }

    fn recompute_mask(&mut self) {
        let mask = self
            .tools
            .iter()
            .flatten()
            .fold(EventSet::EMPTY, |acc, tool| acc | tool.events);
        if mask != self.mask {
            self.tag.bump();
            debug!(mask = mask.bits(), "instrumentation changed");
            self.mask = mask;
        }
    }
}
