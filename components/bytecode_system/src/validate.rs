//! Structural validation of compiler output
//!
//! Runs once per code unit before first execution. Besides operand bounds
//! it performs a full stack-depth analysis so the interpreter can rely on
//! a fixed depth at every instruction boundary.

use thiserror::Error;

use crate::code::ExceptionEntry;
use crate::instruction::WORD_SIZE;
use crate::opcode::{BinaryOperator, ComparisonOperator, Opcode};

/// The code bundle is not structurally well formed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedCodeError {
    /// Byte length is not a multiple of the instruction word size
    #[error("instruction stream length {0} is not a multiple of the word size")]
    UnalignedLength(usize),
    /// No instructions at all
    #[error("empty instruction stream")]
    Empty,
    /// Undefined opcode byte
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode {
        /// Instruction index
        offset: usize,
        /// Raw byte
        opcode: u8,
    },
    /// Compilers may only emit base opcodes
    #[error("{name} at offset {offset} is not valid compiler output")]
    NotCompilerOutput {
        /// Instruction index
        offset: usize,
        /// Opcode mnemonic
        name: &'static str,
    },
    /// `EXTENDED_ARG` prefix with nothing after it
    #[error("EXTENDED_ARG at offset {0} is not followed by an instruction")]
    DanglingExtendedArg(usize),
    /// Operand refers past the end of a pool
    #[error("{pool} index {index} out of range at offset {offset}")]
    IndexOutOfRange {
        /// Instruction index
        offset: usize,
        /// Which pool
        pool: &'static str,
        /// Offending operand
        index: u32,
    },
    /// Operand value not meaningful for the opcode
    #[error("invalid operand {oparg} for {name} at offset {offset}")]
    BadOperand {
        /// Instruction index
        offset: usize,
        /// Opcode mnemonic
        name: &'static str,
        /// Offending operand
        oparg: u32,
    },
    /// Jump lands outside the stream or inside another instruction
    #[error("jump at offset {offset} targets {target}, which is not an instruction boundary")]
    BadJumpTarget {
        /// Instruction index
        offset: usize,
        /// Computed target (may be negative)
        target: i64,
    },
    /// Exception table entry out of bounds or inconsistent
    #[error("exception table entry {index} is invalid: {reason}")]
    BadExceptionEntry {
        /// Entry position
        index: usize,
        /// What is wrong
        reason: &'static str,
    },
    /// Line table runs past the stream
    #[error("line table extends to {0}, past the end of the code")]
    LineTableOutOfRange(usize),
    /// Yield in a non-generator code unit
    #[error("YIELD_VALUE at offset {0} outside a generator")]
    YieldOutsideGenerator(usize),
    /// More parameters than slots
    #[error("argument count {arg_count} exceeds {slots} slots")]
    BadArgCount {
        /// Declared positional parameters
        arg_count: u32,
        /// Slot count
        slots: usize,
    },
    /// Instruction pops more than the stack holds
    #[error("stack underflow at offset {0}")]
    StackUnderflow(usize),
    /// Depth exceeds the declared bound
    #[error("stack depth {depth} exceeds declared size {stack_size} at offset {offset}")]
    StackOverflow {
        /// Instruction index
        offset: usize,
        /// Reached depth
        depth: u32,
        /// Declared bound
        stack_size: u32,
    },
    /// Two paths reach one instruction with different depths
    #[error("inconsistent stack depth at offset {offset}: {first} vs {second}")]
    StackDepthMismatch {
        /// Instruction index
        offset: usize,
        /// Depth from the first path
        first: u32,
        /// Depth from the second path
        second: u32,
    },
    /// Control reaches the end of the stream without returning
    #[error("control falls off the end of the code")]
    FallsOffEnd,
    /// Constant that cannot be decoded
    #[error("invalid constant {0:?}")]
    BadConstant(String),
    /// A nested code constant failed validation
    #[error("in nested code {name:?}: {source}")]
    Nested {
        /// Nested code name
        name: String,
        /// Underlying error
        #[source]
        source: Box<MalformedCodeError>,
    },
}

/// One instruction with its `EXTENDED_ARG` prefixes folded in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Index of the first word (the first prefix, if any)
    pub start: usize,
    /// Index of the word holding the real opcode
    pub index: usize,
    /// Opcode
    pub opcode: Opcode,
    /// Full operand
    pub oparg: u32,
}

impl Decoded {
    /// Index of the following instruction
    pub fn next(&self) -> usize {
        self.index + 1
    }
}

/// Pool sizes and declarations the stream is checked against
#[derive(Debug, Clone)]
pub struct Layout<'a> {
    /// Constant pool size
    pub constants: usize,
    /// Name pool size
    pub names: usize,
    /// Slot count
    pub slots: usize,
    /// Positional parameters
    pub arg_count: u32,
    /// Generator flag
    pub generator: bool,
    /// Declared stack bound; `None` computes it
    pub stack_size: Option<u32>,
    /// Exception table
    pub exception_table: &'a [ExceptionEntry],
}

/// Result of stack-depth analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackAnalysis {
    /// Depth before each reachable instruction start (indexed by word)
    pub depths: Vec<Option<u32>>,
    /// Maximum depth reached
    pub max_depth: u32,
}

/// Split raw bytes into instructions
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Decoded>, MalformedCodeError> {
    if bytes.len() % WORD_SIZE != 0 {
        return Err(MalformedCodeError::UnalignedLength(bytes.len()));
    }
    if bytes.is_empty() {
        return Err(MalformedCodeError::Empty);
    }
    let mut out = Vec::with_capacity(bytes.len() / WORD_SIZE);
    let mut start = 0;
    let mut arg: u32 = 0;
    for (index, word) in bytes.chunks_exact(WORD_SIZE).enumerate() {
        let opcode = Opcode::from_u8(word[0]).ok_or(MalformedCodeError::UnknownOpcode {
            offset: index,
            opcode: word[0],
        })?;
        if !opcode.is_compiler_output() {
            return Err(MalformedCodeError::NotCompilerOutput {
                offset: index,
                name: opcode.name(),
            });
        }
        arg = (arg << 8) | word[1] as u32;
        if opcode == Opcode::ExtendedArg {
            continue;
        }
        out.push(Decoded {
            start,
            index,
            opcode,
            oparg: arg,
        });
        arg = 0;
        start = index + 1;
    }
    let words = bytes.len() / WORD_SIZE;
    if start != words {
        return Err(MalformedCodeError::DanglingExtendedArg(start));
    }
    Ok(out)
}

fn check_operands(inst: &Decoded, layout: &Layout<'_>) -> Result<(), MalformedCodeError> {
    let pool = |pool: &'static str, size: usize| {
        if (inst.oparg as usize) < size {
            Ok(())
        } else {
            Err(MalformedCodeError::IndexOutOfRange {
                offset: inst.index,
                pool,
                index: inst.oparg,
            })
        }
    };
    let bad = || MalformedCodeError::BadOperand {
        offset: inst.index,
        name: inst.opcode.name(),
        oparg: inst.oparg,
    };
    match inst.opcode {
        Opcode::LoadConst | Opcode::ReturnConst => pool("constant", layout.constants),
        Opcode::LoadFast
        | Opcode::StoreFast
        | Opcode::DeleteFast
        | Opcode::LoadDeref
        | Opcode::StoreDeref
        | Opcode::MakeCell => pool("slot", layout.slots),
        Opcode::LoadGlobal | Opcode::StoreGlobal | Opcode::LoadAttr | Opcode::StoreAttr => {
            pool("name", layout.names)
        }
        Opcode::BinaryOp => BinaryOperator::from_oparg(inst.oparg).map(|_| ()).ok_or_else(bad),
        Opcode::CompareOp => ComparisonOperator::from_oparg(inst.oparg)
            .map(|_| ())
            .ok_or_else(bad),
        Opcode::Copy if inst.oparg == 0 => Err(bad()),
        Opcode::Swap if inst.oparg < 2 => Err(bad()),
        Opcode::MakeFunction if inst.oparg > 1 => Err(bad()),
        Opcode::YieldValue if !layout.generator => {
            Err(MalformedCodeError::YieldOutsideGenerator(inst.index))
        }
        _ => Ok(()),
    }
}

/// Validate decoded instructions and compute static stack depths
pub fn validate(
    decoded: &[Decoded],
    words: usize,
    layout: &Layout<'_>,
) -> Result<StackAnalysis, MalformedCodeError> {
    if decoded.is_empty() {
        return Err(MalformedCodeError::Empty);
    }
    if layout.arg_count as usize > layout.slots {
        return Err(MalformedCodeError::BadArgCount {
            arg_count: layout.arg_count,
            slots: layout.slots,
        });
    }

    // instruction start word -> position in `decoded`
    let mut position = vec![None; words];
    for (pos, inst) in decoded.iter().enumerate() {
        position[inst.start] = Some(pos);
    }
    let resolve = |offset: usize, target: i64| -> Result<usize, MalformedCodeError> {
        if target < 0 || target as usize >= words {
            return Err(MalformedCodeError::BadJumpTarget { offset, target });
        }
        position[target as usize].ok_or(MalformedCodeError::BadJumpTarget { offset, target })
    };

    for inst in decoded {
        check_operands(inst, layout)?;
        if inst.opcode.is_backward_jump() {
            let target = inst.next() as i64 - inst.oparg as i64;
            resolve(inst.index, target)?;
        } else if let Some(target) = inst.opcode.jump_target(inst.next(), inst.oparg) {
            resolve(inst.index, target as i64)?;
        }
    }

    let limit = layout.stack_size.unwrap_or(u32::MAX);
    let mut worklist: Vec<(usize, u32)> = vec![(0, 0)];
    for (index, entry) in layout.exception_table.iter().enumerate() {
        let invalid = |reason| MalformedCodeError::BadExceptionEntry { index, reason };
        if entry.start >= entry.end || entry.end as usize > words {
            return Err(invalid("range is empty or out of bounds"));
        }
        if entry.depth > limit {
            return Err(invalid("depth exceeds the declared stack size"));
        }
        let target = entry.target as usize;
        let pos = position
            .get(target)
            .copied()
            .flatten()
            .ok_or_else(|| invalid("handler is not an instruction boundary"))?;
        worklist.push((pos, entry.depth + entry.lasti as u32 + 1));
    }

    let mut depth_at: Vec<Option<u32>> = vec![None; decoded.len()];
    let mut max_depth = 0;
    while let Some((pos, depth)) = worklist.pop() {
        let inst = &decoded[pos];
        if depth > limit {
            return Err(MalformedCodeError::StackOverflow {
                offset: inst.start,
                depth,
                stack_size: limit,
            });
        }
        match depth_at[pos] {
            Some(seen) if seen == depth => continue,
            Some(seen) => {
                return Err(MalformedCodeError::StackDepthMismatch {
                    offset: inst.start,
                    first: seen,
                    second: depth,
                })
            }
            None => depth_at[pos] = Some(depth),
        }
        max_depth = max_depth.max(depth);

        let inputs = inst.opcode.stack_inputs(inst.oparg);
        if depth < inputs {
            return Err(MalformedCodeError::StackUnderflow(inst.index));
        }
        let base = depth - inputs;
        if !inst.opcode.is_terminator() {
            if pos + 1 >= decoded.len() {
                return Err(MalformedCodeError::FallsOffEnd);
            }
            worklist.push((pos + 1, base + inst.opcode.stack_outputs(inst.oparg, false)));
        }
        let target = if inst.opcode.is_backward_jump() {
            inst.next().checked_sub(inst.oparg as usize)
        } else {
            inst.opcode.jump_target(inst.next(), inst.oparg)
        };
        if let Some(target) = target {
            if let Some(tpos) = position.get(target).copied().flatten() {
                worklist.push((tpos, base + inst.opcode.stack_outputs(inst.oparg, true)));
            }
        }
    }

    let mut depths = vec![None; words];
    for (pos, inst) in decoded.iter().enumerate() {
        depths[inst.start] = depth_at[pos];
    }
    Ok(StackAnalysis { depths, max_depth })
}
