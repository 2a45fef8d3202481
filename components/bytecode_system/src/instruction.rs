//! Instruction words and their co-indexed inline cache cells
//!
//! Both live inside a shared [`CodeUnit`](crate::CodeUnit) and are rewritten
//! while other threads may fetch them, so every field is an atomic and every
//! rewrite replaces a whole word.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::opcode::Opcode;

/// Size of one instruction word in bytes
pub const WORD_SIZE: usize = 2;

/// A decoded instruction word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Opcode byte
    pub opcode: Opcode,
    /// Low 8 bits of the operand
    pub oparg: u8,
}

impl Instruction {
    /// Create a new instruction word
    pub fn new(opcode: Opcode, oparg: u8) -> Self {
        Self { opcode, oparg }
    }

    /// Pack into the in-memory cell representation
    pub fn encode(self) -> u16 {
        ((self.opcode as u16) << 8) | self.oparg as u16
    }

    /// Unpack a cell word; `None` if the opcode byte is undefined
    pub fn decode(word: u16) -> Option<Self> {
        let opcode = Opcode::from_u8((word >> 8) as u8)?;
        Some(Self {
            opcode,
            oparg: (word & 0xff) as u8,
        })
    }
}

/// One atomically rewritable instruction slot
#[derive(Debug)]
pub struct InstructionCell(AtomicU16);

impl InstructionCell {
    /// Create a cell holding `instruction`
    pub fn new(instruction: Instruction) -> Self {
        Self(AtomicU16::new(instruction.encode()))
    }

    /// Fetch the whole word
    #[inline]
    pub fn load(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    /// Fetch and decode
    #[inline]
    pub fn get(&self) -> Option<Instruction> {
        Instruction::decode(self.load())
    }

    /// Replace the opcode, keeping the operand, if the cell still holds `expected`
    ///
    /// Returns `false` when another writer got there first.
    pub fn rewrite(&self, expected: Opcode, replacement: Opcode) -> bool {
        let current = self.load();
        if (current >> 8) as u8 != expected as u8 {
            return false;
        }
        let updated = ((replacement as u16) << 8) | (current & 0xff);
        self.0
            .compare_exchange(current, updated, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

const FLAG_DISABLED: u8 = 0x01;

/// Inline cache storage attached to one instruction
///
/// `counter` drives adaptive specialization (or loop hotness on backward
/// jumps). `misses` feeds the exponential backoff. The remaining fields
/// hold the guard payload of whichever specialized form is installed.
#[derive(Debug, Default)]
pub struct CacheCell {
    counter: AtomicU16,
    misses: AtomicU16,
    flags: AtomicU8,
    version: AtomicU32,
    aux_version: AtomicU32,
    index: AtomicU32,
}

/// Guard payload for attribute specializations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrCache {
    /// Type version the cached layout belongs to
    pub type_version: u32,
    /// Layout slot index
    pub index: u32,
}

/// Guard payload for global specializations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalCache {
    /// Keys version of the module namespace
    pub module_version: u32,
    /// Keys version of the builtins namespace (builtin lookups only)
    pub builtins_version: u32,
    /// Entry index in whichever namespace holds the name
    pub index: u32,
}

/// Guard payload for call specializations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCache {
    /// Version of the function object the call site is bound to
    pub func_version: u32,
}

impl CacheCell {
    /// Create an empty cache cell
    pub fn new() -> Self {
        Self::default()
    }

    /// Current adaptive counter
    #[inline]
    pub fn counter(&self) -> u16 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Overwrite the adaptive counter
    #[inline]
    pub fn set_counter(&self, value: u16) {
        self.counter.store(value, Ordering::Relaxed);
    }

    /// Cumulative specialization misses at this site
    pub fn misses(&self) -> u16 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Count one more miss and return the new total
    pub fn record_miss(&self) -> u16 {
        self.misses.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// Whether specialization has been switched off for good at this site
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_DISABLED != 0
    }

    /// Switch specialization off for the life of the code unit
    pub fn disable(&self) {
        self.flags.fetch_or(FLAG_DISABLED, Ordering::AcqRel);
    }

    /// Raw primary version field
    #[inline]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Raw secondary version field
    #[inline]
    pub fn aux_version(&self) -> u32 {
        self.aux_version.load(Ordering::Acquire)
    }

    /// Raw index field
    #[inline]
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    /// Store the raw index field
    pub fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
    }

    fn fill(&self, version: u32, aux_version: u32, index: u32) {
        self.version.store(version, Ordering::Release);
        self.aux_version.store(aux_version, Ordering::Release);
        self.index.store(index, Ordering::Release);
    }

    /// Attribute guard view
    pub fn attr(&self) -> AttrCache {
        AttrCache {
            type_version: self.version(),
            index: self.index(),
        }
    }

    /// Install an attribute guard
    pub fn set_attr(&self, cache: AttrCache) {
        self.fill(cache.type_version, 0, cache.index);
    }

    /// Global guard view
    pub fn global(&self) -> GlobalCache {
        GlobalCache {
            module_version: self.version(),
            builtins_version: self.aux_version(),
            index: self.index(),
        }
    }

    /// Install a global guard
    pub fn set_global(&self, cache: GlobalCache) {
        self.fill(cache.module_version, cache.builtins_version, cache.index);
    }

    /// Call guard view
    pub fn call(&self) -> CallCache {
        CallCache {
            func_version: self.version(),
        }
    }

    /// Install a call guard
    pub fn set_call(&self, cache: CallCache) {
        self.fill(cache.func_version, 0, 0);
    }
}
