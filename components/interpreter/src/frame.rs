//! Activation records
//!
//! A frame is a freestanding heap object. While running, the caller chain
//! hangs off `previous`; a suspended generator frame is detached from any
//! chain and owned by its generator object.

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{CodeUnit, SlotKind};
use core_types::{Namespace, TracebackEntry, Value};

/// Lifecycle of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Built but not yet started
    Created,
    /// Executing, or waiting on a callee
    Running,
    /// A generator frame parked at `YIELD_VALUE`
    Suspended,
    /// Returned or unwound
    Completed,
}

/// Observable position of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    /// Qualified name of the running code
    pub name: Arc<str>,
    /// Index of the next instruction to execute
    pub pc: usize,
    /// Current operand stack depth
    pub stack_depth: usize,
    /// Source line of the current instruction
    pub line: Option<u32>,
}

/// One activation record
pub struct Frame {
    pub(crate) code: Arc<CodeUnit>,
    /// Next instruction to fetch
    pub(crate) pc: usize,
    /// First word of the instruction being executed
    pub(crate) instr: usize,
    pub(crate) stack: Vec<Value>,
    pub(crate) locals: Vec<Option<Value>>,
    pub(crate) globals: Rc<Namespace>,
    pub(crate) builtins: Rc<Namespace>,
    pub(crate) previous: Option<Box<Frame>>,
    pub(crate) state: FrameState,
    pub(crate) depth: usize,
    /// Line of the last `LINE` event delivered for this frame
    pub(crate) last_line: Option<u32>,
    /// Line of the last legacy trace `line` callback
    pub(crate) last_traced_line: Option<u32>,
}

impl Frame {
    /// Create a frame for `code` with every slot unbound
    pub fn new(code: Arc<CodeUnit>, globals: Rc<Namespace>, builtins: Rc<Namespace>) -> Self {
        let slots = code.slots().len();
        let stack = Vec::with_capacity(code.stack_size() as usize);
        Self {
            code,
            pc: 0,
            instr: 0,
            stack,
            locals: vec![None; slots],
            globals,
            builtins,
            previous: None,
            state: FrameState::Created,
            depth: 0,
            last_line: None,
            last_traced_line: None,
        }
    }

    /// Bind positional `args` to parameter slots, packing extras into
    /// the `*args` slot when the code has one
    ///
    /// Returns `false` on an arity mismatch.
    pub(crate) fn bind_arguments(&mut self, mut args: Vec<Value>) -> bool {
        let params = self.code.arg_count() as usize;
        if self.code.has_varargs() {
            if args.len() < params {
                return false;
            }
            let extra = args.split_off(params);
            self.locals[params] = Some(Value::tuple(extra));
        } else if args.len() != params {
            return false;
        }
        for (slot, value) in self.locals.iter_mut().zip(args) {
            *slot = Some(value);
        }
        true
    }

    /// Place captured cells into the free-variable slots, in order
    pub(crate) fn bind_closure(&mut self, cells: &[Rc<core_types::CellObj>]) {
        let free_slots = self
            .code
            .slots()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.kind.contains(SlotKind::FREE))
            .map(|(index, _)| index);
        for (index, cell) in free_slots.zip(cells) {
            self.locals[index] = Some(Value::Cell(Rc::clone(cell)));
        }
    }

    /// The code unit being executed
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    /// Lifecycle state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Nesting depth (1 for the outermost frame)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index of the next instruction
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Operand stack, TOS last
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Local slot `index`, if bound
    pub fn local(&self, index: usize) -> Option<&Value> {
        self.locals.get(index).and_then(Option::as_ref)
    }

    /// Source line of the instruction being executed
    pub fn current_line(&self) -> Option<u32> {
        self.code.line_for(self.instr)
    }

    /// Position and stack depth of this frame
    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            name: Arc::clone(self.code.qualname()),
            pc: self.pc,
            stack_depth: self.stack.len(),
            line: self.current_line(),
        }
    }

    pub(crate) fn traceback_entry(&self) -> TracebackEntry {
        TracebackEntry {
            name: Arc::clone(self.code.qualname()),
            filename: Arc::clone(self.code.filename()),
            line: self.current_line(),
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        // Validation guarantees no instruction pops an empty stack.
        self.stack.pop().unwrap_or(Value::None)
    }

    #[inline]
    pub(crate) fn top(&self) -> Option<&Value> {
        self.stack.last()
    }

    #[inline]
    pub(crate) fn peek(&self, n: usize) -> Option<&Value> {
        let len = self.stack.len();
        len.checked_sub(n + 1).and_then(|i| self.stack.get(i))
    }

    /// Pop the top `n` items, preserving their order
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", self.code.qualname())
            .field("pc", &self.pc)
            .field("stack", &self.stack.len())
            .field("state", &self.state)
            .field("depth", &self.depth)
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}
