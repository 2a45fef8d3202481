//! Code units: the compiled form of one function or module body
//!
//! A code unit is immutable after construction apart from three areas the
//! engine owns: the instruction cells (quickening rewrites opcodes in
//! place, never changing the stream length), the co-indexed cache cells,
//! and the table of installed tier-2 executors.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use num_bigint::BigInt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bundle::{CodeBundle, ConstantSpec, LineRun, SlotSpec};
use crate::disassembler;
use crate::executor::Executor;
use crate::instruction::{CacheCell, Instruction, InstructionCell, WORD_SIZE};
use crate::opcode::Opcode;
use crate::validate::{self, Decoded, Layout, MalformedCodeError};

/// Classification bitmask of one variable slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKind(pub u8);

impl SlotKind {
    /// Positional-only parameter
    pub const POS_ONLY: SlotKind = SlotKind(0x01);
    /// Positional-or-keyword parameter
    pub const POS_OR_KW: SlotKind = SlotKind(0x02);
    /// `*args` parameter
    pub const VARARGS: SlotKind = SlotKind(0x04);
    /// Keyword-only parameter
    pub const KW_ONLY: SlotKind = SlotKind(0x08);
    /// `**kwargs` parameter
    pub const VARKWARGS: SlotKind = SlotKind(0x10);
    /// Plain local variable
    pub const LOCAL: SlotKind = SlotKind(0x20);
    /// Variable captured by an inner function
    pub const CELL: SlotKind = SlotKind(0x40);
    /// Variable captured from an enclosing function
    pub const FREE: SlotKind = SlotKind(0x80);

    /// Whether every bit of `other` is set
    pub fn contains(self, other: SlotKind) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SlotKind {
    type Output = SlotKind;

    fn bitor(self, rhs: SlotKind) -> SlotKind {
        SlotKind(self.0 | rhs.0)
    }
}

/// Code unit flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    /// Calling the function creates a generator
    pub const GENERATOR: CodeFlags = CodeFlags(0x20);

    /// Whether every bit of `other` is set
    pub fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One exception-table range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    /// First covered instruction index
    pub start: u32,
    /// One past the last covered instruction index
    pub end: u32,
    /// Handler instruction index
    pub target: u32,
    /// Operand stack depth to unwind to
    pub depth: u32,
    /// Push the faulting instruction index before the exception
    #[serde(default)]
    pub lasti: bool,
}

impl ExceptionEntry {
    /// Whether `index` lies in the covered range
    pub fn covers(&self, index: usize) -> bool {
        (self.start as usize) <= index && index < self.end as usize
    }
}

/// A named variable slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Variable name
    pub name: Arc<str>,
    /// Classification
    pub kind: SlotKind,
}

/// Compile-time constant
#[derive(Clone)]
pub enum Constant {
    /// `None`
    None,
    /// Boolean
    Bool(bool),
    /// Machine int
    Int(i64),
    /// Arbitrary precision int
    BigInt(BigInt),
    /// Float
    Float(f64),
    /// String
    Str(Arc<str>),
    /// Tuple of constants
    Tuple(Vec<Constant>),
    /// Nested code unit
    Code(Arc<CodeUnit>),
}

impl Constant {
    fn from_spec(spec: &ConstantSpec) -> Result<Self, MalformedCodeError> {
        Ok(match spec {
            ConstantSpec::None => Constant::None,
            ConstantSpec::Bool(b) => Constant::Bool(*b),
            ConstantSpec::Int(i) => Constant::Int(*i),
            ConstantSpec::BigInt(text) => Constant::BigInt(
                text.parse::<BigInt>()
                    .map_err(|_| MalformedCodeError::BadConstant(text.clone()))?,
            ),
            ConstantSpec::Float(f) => Constant::Float(*f),
            ConstantSpec::Str(s) => Constant::Str(Arc::from(s.as_str())),
            ConstantSpec::Tuple(items) => Constant::Tuple(
                items
                    .iter()
                    .map(Constant::from_spec)
                    .collect::<Result<_, _>>()?,
            ),
            ConstantSpec::Code(bundle) => {
                Constant::Code(CodeUnit::from_bundle(bundle).map_err(|err| {
                    MalformedCodeError::Nested {
                        name: bundle.name.clone(),
                        source: Box::new(err),
                    }
                })?)
            }
        })
    }

    /// Convert back into the serialized form
    pub fn to_spec(&self) -> ConstantSpec {
        match self {
            Constant::None => ConstantSpec::None,
            Constant::Bool(b) => ConstantSpec::Bool(*b),
            Constant::Int(i) => ConstantSpec::Int(*i),
            Constant::BigInt(b) => ConstantSpec::BigInt(b.to_string()),
            Constant::Float(f) => ConstantSpec::Float(*f),
            Constant::Str(s) => ConstantSpec::Str(s.to_string()),
            Constant::Tuple(items) => ConstantSpec::Tuple(items.iter().map(Constant::to_spec).collect()),
            Constant::Code(code) => ConstantSpec::Code(Box::new(code.to_bundle())),
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::BigInt(a), Constant::BigInt(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Tuple(a), Constant::Tuple(b)) => a == b,
            (Constant::Code(a), Constant::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::BigInt(b) => write!(f, "{}", b),
            Constant::Float(x) => write!(f, "{:?}", x),
            Constant::Str(s) => write!(f, "'{}'", s),
            Constant::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Constant::Code(code) => write!(f, "<code {}>", code.name()),
        }
    }
}

/// Compiled representation of one function or module body
pub struct CodeUnit {
    name: Arc<str>,
    qualname: Arc<str>,
    filename: Arc<str>,
    first_line: u32,
    cells: Box<[InstructionCell]>,
    caches: Box<[CacheCell]>,
    constants: Vec<Constant>,
    names: Vec<Arc<str>>,
    slots: Vec<Slot>,
    arg_count: u32,
    stack_size: u32,
    flags: CodeFlags,
    lines: Vec<Option<u32>>,
    line_runs: Vec<LineRun>,
    exception_table: Vec<ExceptionEntry>,
    depths: Vec<Option<u32>>,
    executors: RwLock<Vec<Option<Arc<Executor>>>>,
    quickened: AtomicBool,
    rewrites: AtomicU64,
}

impl CodeUnit {
    /// Validate a compiler bundle and build a shareable code unit
    ///
    /// # Errors
    ///
    /// Returns [`MalformedCodeError`] if the bundle is not structurally
    /// well formed: misaligned stream, out-of-range operands or jumps,
    /// inconsistent stack depths, or a bad exception table.
    pub fn from_bundle(bundle: &CodeBundle) -> Result<Arc<Self>, MalformedCodeError> {
        if bundle.code.len() % WORD_SIZE != 0 {
            return Err(MalformedCodeError::UnalignedLength(bundle.code.len()));
        }
        let decoded = validate::decode_stream(&bundle.code)?;
        let constants = bundle
            .constants
            .iter()
            .map(Constant::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let flags = bundle.flags;
        let layout = Layout {
            constants: constants.len(),
            names: bundle.names.len(),
            slots: bundle.slots.len(),
            arg_count: bundle.arg_count,
            generator: flags.contains(CodeFlags::GENERATOR),
            stack_size: Some(bundle.stack_size),
            exception_table: &bundle.exception_table,
        };
        let words = bundle.code.len() / WORD_SIZE;
        let analysis = validate::validate(&decoded, words, &layout)?;

        let mut lines = vec![None; words];
        for run in &bundle.line_table {
            let end = run.start as usize + run.length as usize;
            if end > words {
                return Err(MalformedCodeError::LineTableOutOfRange(end));
            }
            for slot in &mut lines[run.start as usize..end] {
                *slot = Some(run.line);
            }
        }

        let cells = bundle
            .code
            .chunks_exact(WORD_SIZE)
            .map(|word| {
                let opcode = Opcode::from_u8(word[0]).unwrap_or(Opcode::Nop);
                InstructionCell::new(Instruction::new(opcode, word[1]))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let caches = (0..words)
            .map(|_| CacheCell::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let name: Arc<str> = Arc::from(bundle.name.as_str());
        let qualname = bundle
            .qualname
            .as_deref()
            .map(Arc::from)
            .unwrap_or_else(|| Arc::clone(&name));

        Ok(Arc::new(Self {
            name,
            qualname,
            filename: Arc::from(bundle.filename.as_str()),
            first_line: bundle.first_line,
            cells,
            caches,
            constants,
            names: bundle.names.iter().map(|n| Arc::from(n.as_str())).collect(),
            slots: bundle
                .slots
                .iter()
                .map(|slot| Slot {
                    name: Arc::from(slot.name.as_str()),
                    kind: slot.kind,
                })
                .collect(),
            arg_count: bundle.arg_count,
            stack_size: bundle.stack_size,
            flags,
            lines,
            line_runs: bundle.line_table.clone(),
            exception_table: bundle.exception_table.clone(),
            depths: analysis.depths,
            executors: RwLock::new(Vec::new()),
            quickened: AtomicBool::new(false),
            rewrites: AtomicU64::new(0),
        }))
    }

    /// Rebuild the compiler bundle, with every quickened opcode reverted
    pub fn to_bundle(&self) -> CodeBundle {
        let mut code = Vec::with_capacity(self.cells.len() * WORD_SIZE);
        for cell in self.cells.iter() {
            let word = cell.load();
            let opcode = Opcode::from_u8((word >> 8) as u8)
                .map(|op| op.base() as u8)
                .unwrap_or((word >> 8) as u8);
            code.push(opcode);
            code.push((word & 0xff) as u8);
        }
        CodeBundle {
            name: self.name.to_string(),
            qualname: Some(self.qualname.to_string()),
            filename: self.filename.to_string(),
            first_line: self.first_line,
            code,
            constants: self.constants.iter().map(Constant::to_spec).collect(),
            names: self.names.iter().map(|n| n.to_string()).collect(),
            slots: self
                .slots
                .iter()
                .map(|slot| SlotSpec {
                    name: slot.name.to_string(),
                    kind: slot.kind,
                })
                .collect(),
            arg_count: self.arg_count,
            stack_size: self.stack_size,
            flags: self.flags,
            line_table: self.line_runs.clone(),
            exception_table: self.exception_table.clone(),
        }
    }

    /// Function name
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Qualified name
    pub fn qualname(&self) -> &Arc<str> {
        &self.qualname
    }

    /// Source file name
    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    /// First source line
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Number of instruction words
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the stream is empty (never true for a validated unit)
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Constant pool
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Name pool
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    /// Variable slots (locals, then cells, then frees)
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Number of positional parameters
    pub fn arg_count(&self) -> u32 {
        self.arg_count
    }

    /// Declared operand stack bound
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// Flags
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Whether calling this code creates a generator
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Whether the slot after the positional parameters collects extra arguments
    pub fn has_varargs(&self) -> bool {
        self.slots
            .get(self.arg_count as usize)
            .map(|slot| slot.kind.contains(SlotKind::VARARGS))
            .unwrap_or(false)
    }

    /// Exception table
    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    /// Raw instruction word at `index`
    #[inline]
    pub fn word(&self, index: usize) -> Option<u16> {
        self.cells.get(index).map(InstructionCell::load)
    }

    /// Decoded live instruction at `index`
    pub fn instruction(&self, index: usize) -> Option<Instruction> {
        self.cells.get(index).and_then(InstructionCell::get)
    }

    /// Live opcode at `index`
    pub fn opcode_at(&self, index: usize) -> Option<Opcode> {
        self.instruction(index).map(|inst| inst.opcode)
    }

    /// Cache cell co-indexed with instruction `index`
    ///
    /// Out-of-range indices clamp to the last cell; callers pass validated
    /// instruction indices.
    #[inline]
    pub fn cache(&self, index: usize) -> &CacheCell {
        let last = self.caches.len().saturating_sub(1);
        &self.caches[index.min(last)]
    }

    /// Rewrite the opcode at `index` from `expected` to `replacement`
    pub fn rewrite(&self, index: usize, expected: Opcode, replacement: Opcode) -> bool {
        let done = self
            .cells
            .get(index)
            .map(|cell| cell.rewrite(expected, replacement))
            .unwrap_or(false);
        if done {
            self.rewrites.fetch_add(1, Ordering::Relaxed);
        }
        done
    }

    /// Number of in-place rewrites performed so far
    pub fn rewrite_count(&self) -> u64 {
        self.rewrites.load(Ordering::Relaxed)
    }

    /// Source line of instruction `index`
    pub fn line_for(&self, index: usize) -> Option<u32> {
        self.lines.get(index).copied().flatten()
    }

    /// Innermost exception handler covering instruction `index`
    pub fn handler_for(&self, index: usize) -> Option<&ExceptionEntry> {
        self.exception_table
            .iter()
            .filter(|entry| entry.covers(index))
            .min_by_key(|entry| entry.end - entry.start)
    }

    /// Statically computed stack depth before the instruction starting at `index`
    pub fn stack_depth_at(&self, index: usize) -> Option<u32> {
        self.depths.get(index).copied().flatten()
    }

    /// Decode the live stream, folding `EXTENDED_ARG` prefixes
    pub fn decoded(&self) -> Vec<Decoded> {
        let mut out = Vec::new();
        let mut start = 0;
        let mut arg: u32 = 0;
        for (index, cell) in self.cells.iter().enumerate() {
            let Some(inst) = cell.get() else {
                continue;
            };
            arg = (arg << 8) | inst.oparg as u32;
            if inst.opcode == Opcode::ExtendedArg {
                continue;
            }
            out.push(Decoded {
                start,
                index,
                opcode: inst.opcode,
                oparg: arg,
            });
            arg = 0;
            start = index + 1;
        }
        out
    }

    /// Indices of instructions whose live opcode deoptimizes to `base`
    pub fn find_base(&self, base: Opcode) -> Vec<usize> {
        self.decoded()
            .into_iter()
            .filter(|d| d.opcode.base() == base)
            .map(|d| d.index)
            .collect()
    }

    /// Prime adaptive counters; returns `false` if already done
    pub fn quicken(&self, warmup: u16, jump_threshold: u16) -> bool {
        if self
            .quickened
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        for (index, cell) in self.cells.iter().enumerate() {
            match cell.get().map(|inst| inst.opcode) {
                Some(op) if op.is_adaptive() => self.caches[index].set_counter(warmup),
                Some(Opcode::JumpBackward) => self.caches[index].set_counter(jump_threshold),
                _ => {}
            }
        }
        true
    }

    /// Whether [`quicken`](Self::quicken) has run
    pub fn is_quickened(&self) -> bool {
        self.quickened.load(Ordering::Acquire)
    }

    /// Attach an executor to the backward jump at `origin`
    ///
    /// The jump's opcode becomes `ENTER_EXECUTOR` (operand preserved) and
    /// its cache index points at the executor. Returns the executor index,
    /// or `None` if `origin` no longer holds a plain `JUMP_BACKWARD`.
    pub fn install_executor(&self, origin: usize, executor: Arc<Executor>) -> Option<u32> {
        if self.opcode_at(origin) != Some(Opcode::JumpBackward) {
            return None;
        }
        let mut executors = self.executors.write();
        let index = executors.len() as u32;
        self.cache(origin).set_index(index);
        executors.push(Some(executor));
        if !self.rewrite(origin, Opcode::JumpBackward, Opcode::EnterExecutor) {
            executors.pop();
            return None;
        }
        Some(index)
    }

    /// Executor by table index
    pub fn executor(&self, index: u32) -> Option<Arc<Executor>> {
        self.executors
            .read()
            .get(index as usize)
            .and_then(|slot| slot.clone())
    }

    /// Executor attached to the jump at `origin`, if any
    pub fn executor_at(&self, origin: usize) -> Option<Arc<Executor>> {
        if self.opcode_at(origin) != Some(Opcode::EnterExecutor) {
            return None;
        }
        self.executor(self.cache(origin).index())
    }

    /// Detach and invalidate the executor at `origin`, restoring the jump
    pub fn detach_executor(&self, origin: usize) -> Option<Arc<Executor>> {
        let index = self.cache(origin).index() as usize;
        let removed = {
            let mut executors = self.executors.write();
            executors.get_mut(index).and_then(Option::take)
        };
        self.rewrite(origin, Opcode::EnterExecutor, Opcode::JumpBackward);
        if let Some(executor) = &removed {
            executor.invalidate();
        }
        removed
    }

    /// Number of executors currently attached
    pub fn executor_count(&self) -> usize {
        self.executors.read().iter().filter(|e| e.is_some()).count()
    }

    /// Human readable listing of the live instruction stream
    pub fn disassemble(&self) -> String {
        disassembler::disassemble(self)
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.name)
            .field("words", &self.cells.len())
            .field("constants", &self.constants.len())
            .field("slots", &self.slots.len())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}
