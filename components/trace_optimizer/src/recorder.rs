//! Trace recorder
//!
//! The recorder rides along with tier-1 execution of one frame. For every
//! instruction of that frame it is shown the instruction and the live
//! operand stack *before* the instruction runs, and translates it into
//! guards (verified against the values it can see) followed by effect uops.
//! Recording ends when control arrives back at the backward jump it started
//! from, or aborts when the loop body does something a trace cannot express.

use std::sync::Arc;

use arrayvec::ArrayVec;
use bytecode_system::{
    BinaryOperator, CodeUnit, Opcode, UopId, UopInstruction, VersionTag,
};
use core_types::{Namespace, Value};
use tracing::debug;

use crate::error::AbortReason;
use crate::trace::Trace;

/// Most uops one instruction translates into
const MAX_UOPS_PER_INSTRUCTION: usize = 4;

type Emitted = ArrayVec<UopInstruction, MAX_UOPS_PER_INSTRUCTION>;

/// Bounds on a single recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderLimits {
    /// Longest trace accepted, counting the closing `_JUMP_TO_TOP`
    pub max_trace_length: usize,
    /// Most `CALL` instructions one trace may contain
    pub max_trace_calls: usize,
}

impl Default for RecorderLimits {
    fn default() -> Self {
        Self {
            max_trace_length: 256,
            max_trace_calls: 4,
        }
    }
}

/// One tier-1 instruction about to execute in the recording frame
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Index of the first word of the instruction (its `EXTENDED_ARG`s)
    pub start: usize,
    /// Index of the opcode word itself
    pub index: usize,
    /// Index of the following instruction
    pub next: usize,
    /// Live opcode, possibly a specialized form
    pub opcode: Opcode,
    /// Full operand after `EXTENDED_ARG` accumulation
    pub oparg: u32,
    /// Operand stack, TOS last
    pub stack: &'a [Value],
    /// Module namespace of the frame
    pub globals: &'a Namespace,
    /// Builtins namespace of the frame
    pub builtins: &'a Namespace,
}

impl<'a> Observation<'a> {
    /// Stack item `n` places below TOS (0 = TOS)
    fn peek(&self, n: usize) -> Option<&'a Value> {
        let len = self.stack.len();
        len.checked_sub(n + 1).and_then(|i| self.stack.get(i))
    }
}

/// Outcome of observing one instruction
#[derive(Debug)]
pub enum RecordStatus {
    /// Keep recording
    Continue,
    /// The loop closed; the trace is ready for optimization
    Complete(Trace),
    /// Recording was abandoned
    Abort(AbortReason),
}

/// Recording state for one loop
pub struct TraceRecorder {
    code: Arc<CodeUnit>,
    depth: usize,
    origin: usize,
    entry: usize,
    uops: Vec<UopInstruction>,
    dependencies: Vec<(Arc<VersionTag>, u32)>,
    calls: usize,
    limits: RecorderLimits,
}

impl TraceRecorder {
    /// Begin recording the loop closed by the backward jump at `origin`
    ///
    /// `depth` identifies the recording frame among nested calls of the same
    /// code unit; `entry` is the loop head the jump targets.
    pub fn start(
        code: Arc<CodeUnit>,
        depth: usize,
        origin: usize,
        entry: usize,
        limits: RecorderLimits,
    ) -> Self {
        debug!(code = %code.qualname(), origin, entry, "recording started");
        Self {
            code,
            depth,
            origin,
            entry,
            uops: vec![UopInstruction::new(UopId::CheckValidity, 0, entry as u32)],
            dependencies: Vec::new(),
            calls: 0,
            limits,
        }
    }

    /// Whether the frame running `code` at `depth` is the one being recorded
    pub fn is_recording(&self, code: &Arc<CodeUnit>, depth: usize) -> bool {
        self.depth == depth && Arc::ptr_eq(&self.code, code)
    }

    /// Index of the originating backward jump
    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Loop head
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Code unit being recorded
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    /// Uops recorded so far
    pub fn len(&self) -> usize {
        self.uops.len()
    }

    /// Whether nothing beyond the leading validity check was recorded
    pub fn is_empty(&self) -> bool {
        self.uops.len() <= 1
    }

    /// Make the trace depend on `tag` still holding `version`
    pub fn depend_on(&mut self, tag: &Arc<VersionTag>, version: u32) {
        let known = self
            .dependencies
            .iter()
            .any(|(existing, _)| Arc::ptr_eq(existing, tag));
        if !known {
            self.dependencies.push((Arc::clone(tag), version));
        }
    }

    /// Translate one instruction before it executes
    pub fn observe(&mut self, observation: &Observation<'_>) -> RecordStatus {
        if observation.index == self.origin {
            return self.close(observation);
        }
        if observation.start < self.entry || observation.index > self.origin {
            return self.abort(AbortReason::LeftLoop {
                index: observation.index,
            });
        }

        let mut emitted = Emitted::new();
        if let Err(reason) = self.translate(observation, &mut emitted) {
            return self.abort(reason);
        }
        // One slot stays reserved for the closing jump.
        if self.uops.len() + emitted.len() + 1 > self.limits.max_trace_length {
            return self.abort(AbortReason::TooLong {
                limit: self.limits.max_trace_length,
            });
        }
        self.uops.extend(emitted);
        RecordStatus::Continue
    }

    /// Abandon the recording from outside (exception, frame exit, ...)
    pub fn abort(&mut self, reason: AbortReason) -> RecordStatus {
        debug!(
            code = %self.code.qualname(),
            origin = self.origin,
            uops = self.uops.len(),
            %reason,
            "recording aborted"
        );
        self.uops.clear();
        RecordStatus::Abort(reason)
    }

    fn close(&mut self, observation: &Observation<'_>) -> RecordStatus {
        if observation.opcode != Opcode::JumpBackward {
            return self.abort(AbortReason::Untranslatable {
                opcode: observation.opcode,
                index: observation.index,
            });
        }
        if self.uops.len() + 1 > self.limits.max_trace_length {
            return self.abort(AbortReason::TooLong {
                limit: self.limits.max_trace_length,
            });
        }
        let mut uops = std::mem::take(&mut self.uops);
        uops.push(UopInstruction::new(UopId::JumpToTop, 0, self.entry as u32));
        debug!(
            code = %self.code.qualname(),
            origin = self.origin,
            uops = uops.len(),
            "recording complete"
        );
        RecordStatus::Complete(Trace::new(
            Arc::clone(&self.code),
            self.origin,
            self.entry,
            uops,
            std::mem::take(&mut self.dependencies),
        ))
    }

    fn translate(
        &mut self,
        obs: &Observation<'_>,
        out: &mut Emitted,
    ) -> Result<(), AbortReason> {
        let target = obs.start as u32;
        let oparg = obs.oparg;
        let simple = |id| UopInstruction::new(id, oparg, target);
        match obs.opcode.base() {
            Opcode::Nop | Opcode::Resume | Opcode::JumpForward => {}
            Opcode::PopTop => out.push(simple(UopId::PopTop)),
            Opcode::Copy => out.push(simple(UopId::Copy)),
            Opcode::Swap => out.push(simple(UopId::Swap)),
            Opcode::LoadConst => out.push(simple(UopId::LoadConst)),
            Opcode::LoadFast => out.push(simple(UopId::LoadFast)),
            Opcode::StoreFast => out.push(simple(UopId::StoreFast)),
            Opcode::LoadDeref => out.push(simple(UopId::LoadDeref)),
            Opcode::StoreDeref => out.push(simple(UopId::StoreDeref)),
            Opcode::StoreGlobal => out.push(simple(UopId::StoreGlobal)),
            Opcode::UnaryNot => out.push(simple(UopId::UnaryNot)),
            Opcode::UnaryNegative => out.push(simple(UopId::UnaryNegative)),
            Opcode::BuildTuple => out.push(simple(UopId::BuildTuple)),
            Opcode::BuildList => out.push(simple(UopId::BuildList)),
            Opcode::BinarySubscr => out.push(simple(UopId::BinarySubscr)),
            Opcode::LoadGlobal => self.record_load_global(obs, out),
            Opcode::LoadAttr => self.record_load_attr(obs, out),
            Opcode::StoreAttr => self.record_store_attr(obs, out),
            Opcode::BinaryOp => record_binary_op(obs, out),
            Opcode::CompareOp => record_compare_op(obs, out),
            Opcode::ForIter => record_for_iter(obs, out)?,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let truthy = obs.peek(0).map_or(false, Value::is_truthy);
                let guard = if truthy {
                    UopId::GuardIsTruePop
                } else {
                    UopId::GuardIsFalsePop
                };
                out.push(UopInstruction::new(guard, 0, target));
            }
            Opcode::Call => self.record_call(obs, out)?,
            Opcode::JumpBackward => {
                return Err(AbortReason::InnerLoop { index: obs.index });
            }
            _ => {
                return Err(AbortReason::Untranslatable {
                    opcode: obs.opcode,
                    index: obs.index,
                });
            }
        }
        Ok(())
    }

    fn record_load_global(&mut self, obs: &Observation<'_>, out: &mut Emitted) {
        let target = obs.start as u32;
        let name = match self.code.names().get(obs.oparg as usize) {
            Some(name) => Arc::clone(name),
            None => {
                out.push(UopInstruction::new(UopId::LoadGlobal, obs.oparg, target));
                return;
            }
        };
        let globals_version = obs.globals.keys_version();
        if let Some(index) = obs.globals.index_of(&name) {
            self.depend_on(obs.globals.version_tag(), globals_version);
            out.push(UopInstruction::with_operand(
                UopId::GuardGlobalsVersion,
                0,
                globals_version as u64,
                target,
            ));
            out.push(UopInstruction::new(UopId::LoadGlobalModule, index as u32, target));
        } else if let Some(index) = obs.builtins.index_of(&name) {
            let builtins_version = obs.builtins.keys_version();
            self.depend_on(obs.globals.version_tag(), globals_version);
            self.depend_on(obs.builtins.version_tag(), builtins_version);
            out.push(UopInstruction::with_operand(
                UopId::GuardGlobalsVersion,
                0,
                globals_version as u64,
                target,
            ));
            out.push(UopInstruction::with_operand(
                UopId::GuardBuiltinsVersion,
                0,
                builtins_version as u64,
                target,
            ));
            out.push(UopInstruction::new(UopId::LoadGlobalBuiltin, index as u32, target));
        } else {
            out.push(UopInstruction::new(UopId::LoadGlobal, obs.oparg, target));
        }
    }

    fn record_load_attr(&mut self, obs: &Observation<'_>, out: &mut Emitted) {
        let target = obs.start as u32;
        let name = self.code.names().get(obs.oparg as usize).cloned();
        if let Some(name) = name {
            match obs.peek(0) {
                Some(Value::Instance(obj)) => {
                    let class = obj.class();
                    if let Some(slot) = class.slot_of(&name) {
                        if obj.has_slot(slot) {
                            self.depend_on(class.version_tag(), class.version());
                            out.push(UopInstruction::with_operand(
                                UopId::GuardTypeVersion,
                                0,
                                class.version() as u64,
                                target,
                            ));
                            out.push(UopInstruction::new(
                                UopId::LoadAttrInstanceValue,
                                slot as u32,
                                target,
                            ));
                            return;
                        }
                    }
                }
                Some(Value::Type(class)) if class.class_attr(&name).is_some() => {
                    self.depend_on(class.version_tag(), class.version());
                    out.push(UopInstruction::with_operand(
                        UopId::GuardTypeVersion,
                        0,
                        class.version() as u64,
                        target,
                    ));
                    out.push(UopInstruction::new(UopId::LoadAttrClass, obs.oparg, target));
                    return;
                }
                _ => {}
            }
        }
        out.push(UopInstruction::new(UopId::LoadAttr, obs.oparg, target));
    }

    fn record_store_attr(&mut self, obs: &Observation<'_>, out: &mut Emitted) {
        let target = obs.start as u32;
        let name = self.code.names().get(obs.oparg as usize).cloned();
        if let (Some(name), Some(Value::Instance(obj))) = (name, obs.peek(0)) {
            let class = obj.class();
            if let Some(slot) = class.slot_of(&name) {
                self.depend_on(class.version_tag(), class.version());
                out.push(UopInstruction::with_operand(
                    UopId::GuardTypeVersion,
                    0,
                    class.version() as u64,
                    target,
                ));
                out.push(UopInstruction::new(
                    UopId::StoreAttrInstanceValue,
                    slot as u32,
                    target,
                ));
                return;
            }
        }
        out.push(UopInstruction::new(UopId::StoreAttr, obs.oparg, target));
    }

    fn record_call(&mut self, obs: &Observation<'_>, out: &mut Emitted) -> Result<(), AbortReason> {
        self.calls += 1;
        if self.calls > self.limits.max_trace_calls {
            return Err(AbortReason::TooManyCalls {
                limit: self.limits.max_trace_calls,
            });
        }
        let target = obs.start as u32;
        let argc = obs.oparg;
        if let Some(Value::Function(func)) = obs.peek(argc as usize) {
            let code = func.code();
            if code.arg_count() == argc && !code.is_generator() && !code.has_varargs() {
                out.push(UopInstruction::with_operand(
                    UopId::CheckFunctionExactArgs,
                    argc,
                    func.version() as u64,
                    target,
                ));
            }
        }
        out.push(UopInstruction::new(UopId::Call, argc, target));
        // The callee may have invalidated anything this trace relies on.
        out.push(UopInstruction::new(UopId::CheckValidity, 0, obs.next as u32));
        Ok(())
    }
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder")
            .field("code", self.code.qualname())
            .field("depth", &self.depth)
            .field("origin", &self.origin)
            .field("entry", &self.entry)
            .field("uops", &self.uops.len())
            .field("calls", &self.calls)
            .finish()
    }
}

fn record_binary_op(obs: &Observation<'_>, out: &mut Emitted) {
    let target = obs.start as u32;
    let op = BinaryOperator::from_oparg(obs.oparg);
    let specialized = match (obs.peek(1), obs.peek(0), op) {
        (Some(Value::Int(_)), Some(Value::Int(_)), Some(op)) => match op {
            BinaryOperator::Add => Some((UopId::GuardBothInt, UopId::BinaryOpAddInt)),
            BinaryOperator::Subtract => Some((UopId::GuardBothInt, UopId::BinaryOpSubtractInt)),
            BinaryOperator::Multiply => Some((UopId::GuardBothInt, UopId::BinaryOpMultiplyInt)),
            _ => None,
        },
        (Some(Value::Float(_)), Some(Value::Float(_)), Some(op)) => match op {
            BinaryOperator::Add => Some((UopId::GuardBothFloat, UopId::BinaryOpAddFloat)),
            BinaryOperator::Subtract => {
                Some((UopId::GuardBothFloat, UopId::BinaryOpSubtractFloat))
            }
            BinaryOperator::Multiply => {
                Some((UopId::GuardBothFloat, UopId::BinaryOpMultiplyFloat))
            }
            _ => None,
        },
        (Some(Value::Str(_)), Some(Value::Str(_)), Some(BinaryOperator::Add)) => {
            Some((UopId::GuardBothUnicode, UopId::BinaryOpAddUnicode))
        }
        _ => None,
    };
    match specialized {
        Some((guard, effect)) => {
            out.push(UopInstruction::new(guard, 0, target));
            out.push(UopInstruction::new(effect, obs.oparg, target));
        }
        None => out.push(UopInstruction::new(UopId::BinaryOp, obs.oparg, target)),
    }
}

fn record_compare_op(obs: &Observation<'_>, out: &mut Emitted) {
    let target = obs.start as u32;
    let specialized = match (obs.peek(1), obs.peek(0)) {
        (Some(Value::Int(_)), Some(Value::Int(_))) => {
            Some((UopId::GuardBothInt, UopId::CompareOpInt))
        }
        (Some(Value::Float(_)), Some(Value::Float(_))) => {
            Some((UopId::GuardBothFloat, UopId::CompareOpFloat))
        }
        (Some(Value::Str(_)), Some(Value::Str(_))) => {
            Some((UopId::GuardBothUnicode, UopId::CompareOpStr))
        }
        _ => None,
    };
    match specialized {
        Some((guard, effect)) => {
            out.push(UopInstruction::new(guard, 0, target));
            out.push(UopInstruction::new(effect, obs.oparg, target));
        }
        None => out.push(UopInstruction::new(UopId::CompareOp, obs.oparg, target)),
    }
}

fn record_for_iter(obs: &Observation<'_>, out: &mut Emitted) -> Result<(), AbortReason> {
    let target = obs.start as u32;
    let (guard, next) = match obs.peek(0) {
        Some(Value::RangeIter(it)) if !it.is_exhausted() => {
            (UopId::GuardNotExhaustedRange, UopId::IterNextRange)
        }
        Some(Value::ListIter(it)) if !it.is_exhausted() => {
            (UopId::GuardNotExhaustedList, UopId::IterNextList)
        }
        Some(Value::RangeIter(_)) | Some(Value::ListIter(_)) => {
            return Err(AbortReason::Exhausted { index: obs.index });
        }
        _ => {
            return Err(AbortReason::Untranslatable {
                opcode: obs.opcode,
                index: obs.index,
            });
        }
    };
    out.push(UopInstruction::new(guard, 0, target));
    out.push(UopInstruction::new(next, 0, target));
    Ok(())
}
