//! Trace optimizer pipeline
//!
//! Passes run in a fixed order:
//!
//! 1. redundant guard elimination ([`crate::facts`])
//! 2. constant folding of pure uops into `_LOAD_CONST_INLINE`
//! 3. `_NOP` removal
//! 4. superinstruction fusion ([`crate::fusion`])
//!
//! Every pass preserves the side-exit contract: whenever an exit-capable uop
//! can leave the trace, the operand stack and locals are exactly what tier-1
//! expects at that uop's target.

use std::cmp::Ordering;
use std::sync::Arc;

use bytecode_system::{ComparisonOperator, Constant, Executor, UopId, UopInstruction};
use tracing::debug;

use crate::facts::eliminate_guards;
use crate::fusion::fuse;
use crate::trace::Trace;

/// Cumulative optimizer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizerStats {
    /// Traces turned into executors
    pub traces: u64,
    /// Uops recorded, before optimization
    pub uops_in: u64,
    /// Uops emitted, after optimization
    pub uops_out: u64,
    /// Guards proven redundant
    pub guards_removed: u64,
    /// Pure uops replaced by inline constants
    pub constants_folded: u64,
    /// `_NOP`s dropped
    pub nops_removed: u64,
    /// Superinstructions formed
    pub fused: u64,
}

/// Which passes to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizerPasses {
    /// Drop guards whose facts are already known
    pub eliminate_guards: bool,
    /// Fold pure uops over trace-time constants
    pub fold_constants: bool,
    /// Form superinstructions
    pub fuse: bool,
}

impl Default for OptimizerPasses {
    fn default() -> Self {
        Self {
            eliminate_guards: true,
            fold_constants: true,
            fuse: true,
        }
    }
}

/// Turns recorded traces into executors
#[derive(Debug, Default)]
pub struct TraceOptimizer {
    passes: OptimizerPasses,
    stats: OptimizerStats,
}

impl TraceOptimizer {
    /// Optimizer running every pass
    pub fn new() -> Self {
        Self::default()
    }

    /// Optimizer running only the selected passes
    pub fn with_passes(passes: OptimizerPasses) -> Self {
        Self {
            passes,
            stats: OptimizerStats::default(),
        }
    }

    /// Optimize `trace` into an executor ready to install
    pub fn optimize(&mut self, trace: Trace) -> Executor {
        let code = Arc::clone(trace.code());
        let (origin, entry) = (trace.origin(), trace.entry());
        let (mut uops, dependencies) = trace.into_parts();
        let recorded = uops.len();

        let guards = if self.passes.eliminate_guards {
            eliminate_guards(&mut uops, code.constants(), code.slots().len())
        } else {
            0
        };
        let mut consts = Vec::new();
        let folded = if self.passes.fold_constants {
            fold_constants(&mut uops, code.constants(), &mut consts)
        } else {
            0
        };
        let nops = remove_nops(&mut uops);
        let fused = if self.passes.fuse {
            let (out, count) = fuse(&uops);
            uops = out;
            count
        } else {
            0
        };

        debug!(
            code = %code.qualname(),
            origin,
            recorded,
            emitted = uops.len(),
            guards,
            folded,
            fused,
            "trace optimized"
        );
        self.stats.traces += 1;
        self.stats.uops_in += recorded as u64;
        self.stats.uops_out += uops.len() as u64;
        self.stats.guards_removed += guards as u64;
        self.stats.constants_folded += folded as u64;
        self.stats.nops_removed += nops as u64;
        self.stats.fused += fused as u64;

        Executor::new(uops, consts, dependencies, origin as u32, entry as u32)
    }

    /// Counters so far
    pub fn stats(&self) -> OptimizerStats {
        self.stats
    }
}

/// Known constant on the abstract stack and the uop that pushed it
#[derive(Clone)]
struct ConstSlot {
    value: Constant,
    producer: usize,
}

/// Fold pure uops whose inputs are all constants
///
/// The producers of the inputs become `_NOP` and the pure uop becomes a
/// `_LOAD_CONST_INLINE` of the result, appended to `consts`. Folding is
/// skipped when a uop that can side-exit or raise sits between the first
/// producer and the pure uop, since tier-1 and the exception table would
/// expect the inputs on the stack there.
pub fn fold_constants(
    uops: &mut [UopInstruction],
    constants: &[Constant],
    consts: &mut Vec<Constant>,
) -> usize {
    let mut stack: Vec<Option<ConstSlot>> = Vec::new();
    let mut last_barrier: Option<usize> = None;
    let mut folded = 0;

    for position in 0..uops.len() {
        let uop = uops[position];
        let inputs = uop.id.stack_inputs(uop.oparg) as usize;

        if uop.id.is_pure() && stack.len() >= inputs {
            let operands: Option<Vec<ConstSlot>> =
                stack[stack.len() - inputs..].iter().cloned().collect();
            if let Some(operands) = operands {
                let first = operands.iter().map(|slot| slot.producer).min();
                let clear = match (first, last_barrier) {
                    (Some(first), Some(exit)) => first > exit,
                    _ => true,
                };
                let values: Vec<Constant> = operands.iter().map(|s| s.value.clone()).collect();
                let result = if clear {
                    evaluate(uop.id, uop.oparg, &values)
                } else {
                    None
                };
                if let Some(result) = result {
                    for slot in &operands {
                        let target = uops[slot.producer].target;
                        uops[slot.producer] = UopInstruction::new(UopId::Nop, 0, target);
                    }
                    let index = intern(consts, result.clone());
                    uops[position] = UopInstruction::new(UopId::LoadConstInline, index, uop.target);
                    stack.truncate(stack.len() - inputs);
                    stack.push(Some(ConstSlot {
                        value: result,
                        producer: position,
                    }));
                    folded += 1;
                    continue;
                }
            }
        }

        if uop.id.can_exit() || uop.id.can_raise() {
            last_barrier = Some(position);
        }
        match uop.id {
            UopId::LoadConst => stack.push(constants.get(uop.oparg as usize).map(|value| {
                ConstSlot {
                    value: value.clone(),
                    producer: position,
                }
            })),
            UopId::LoadConstInline => stack.push(consts.get(uop.oparg as usize).map(|value| {
                ConstSlot {
                    value: value.clone(),
                    producer: position,
                }
            })),
            _ => {
                let outputs = uop.id.stack_outputs(uop.oparg) as usize;
                stack.truncate(stack.len().saturating_sub(inputs));
                stack.extend(std::iter::repeat(None).take(outputs));
            }
        }
    }
    folded
}

fn intern(consts: &mut Vec<Constant>, value: Constant) -> u32 {
    if let Some(index) = consts.iter().position(|c| *c == value) {
        return index as u32;
    }
    consts.push(value);
    (consts.len() - 1) as u32
}

/// Result of a pure uop on constant inputs, if it is representable
fn evaluate(id: UopId, oparg: u32, inputs: &[Constant]) -> Option<Constant> {
    match (id, inputs) {
        (UopId::BinaryOpAddInt, [Constant::Int(a), Constant::Int(b)]) => {
            a.checked_add(*b).map(Constant::Int)
        }
        (UopId::BinaryOpSubtractInt, [Constant::Int(a), Constant::Int(b)]) => {
            a.checked_sub(*b).map(Constant::Int)
        }
        (UopId::BinaryOpMultiplyInt, [Constant::Int(a), Constant::Int(b)]) => {
            a.checked_mul(*b).map(Constant::Int)
        }
        (UopId::BinaryOpAddFloat, [Constant::Float(a), Constant::Float(b)]) => {
            Some(Constant::Float(a + b))
        }
        (UopId::BinaryOpSubtractFloat, [Constant::Float(a), Constant::Float(b)]) => {
            Some(Constant::Float(a - b))
        }
        (UopId::BinaryOpMultiplyFloat, [Constant::Float(a), Constant::Float(b)]) => {
            Some(Constant::Float(a * b))
        }
        (UopId::BinaryOpAddUnicode, [Constant::Str(a), Constant::Str(b)]) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Some(Constant::Str(joined.into()))
        }
        (UopId::CompareOpInt, [Constant::Int(a), Constant::Int(b)]) => {
            compare(oparg, Some(a.cmp(b)))
        }
        (UopId::CompareOpFloat, [Constant::Float(a), Constant::Float(b)]) => {
            compare(oparg, a.partial_cmp(b))
        }
        (UopId::CompareOpStr, [Constant::Str(a), Constant::Str(b)]) => {
            compare(oparg, Some(a.cmp(b)))
        }
        (UopId::UnaryNot, [value]) => truthiness(value).map(|t| Constant::Bool(!t)),
        _ => None,
    }
}

fn compare(oparg: u32, ordering: Option<Ordering>) -> Option<Constant> {
    let op = ComparisonOperator::from_oparg(oparg)?;
    Some(Constant::Bool(op.matches(ordering?)))
}

fn truthiness(value: &Constant) -> Option<bool> {
    Some(match value {
        Constant::None => false,
        Constant::Bool(b) => *b,
        Constant::Int(i) => *i != 0,
        Constant::Float(f) => *f != 0.0,
        Constant::Str(s) => !s.is_empty(),
        Constant::Tuple(items) => !items.is_empty(),
        Constant::Code(_) => true,
        Constant::BigInt(_) => return None,
    })
}

/// Drop `_NOP`s, returning how many were removed
pub fn remove_nops(uops: &mut Vec<UopInstruction>) -> usize {
    let before = uops.len();
    uops.retain(|uop| uop.id != UopId::Nop);
    before - uops.len()
}
