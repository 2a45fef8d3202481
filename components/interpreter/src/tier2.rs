//! Tier-2: hot-loop recording, executor installation and the uop runtime
//!
//! A backward jump that gets hot starts a recording of its loop. A closed
//! recording is optimized into an [`Executor`] and attached to the jump,
//! which becomes `ENTER_EXECUTOR`. Executors run until a guard fails (a
//! side exit back into tier-1 at the failing instruction) or the eval
//! breaker is set.

use std::sync::Arc;

use bytecode_system::{unpack_pair, BinaryOperator, CodeUnit, Executor, Opcode, UopId, UopInstruction};
use core_types::{FatalError, Unwind, Value};
use trace_optimizer::{AbortReason, Observation, RecordStatus, Trace, TraceRecorder};
use tracing::{debug, trace};

use crate::dispatch::{
    checked_int, concat, constant_at, float_op, load_deref, load_global, name_at, store_deref,
};
use crate::frame::Frame;
use crate::monitoring::{Event, Payload};
use crate::operations;
use crate::specialize;
use crate::vm::Vm;

/// What the runtime does after one uop
enum Step {
    Next,
    /// Leave the executor; tier-1 resumes at this instruction
    Exit(u32),
    /// Back to the first uop
    Restart,
}

impl Vm {
    pub(crate) fn is_recording(&self, frame: &Frame) -> bool {
        self.recorder
            .as_ref()
            .map_or(false, |recorder| recorder.is_recording(&frame.code, frame.depth))
    }

    /// Show the recorder the instruction about to run in `frame`
    pub(crate) fn observe(
        &mut self,
        frame: &Frame,
        start: usize,
        index: usize,
        opcode: Opcode,
        oparg: u32,
    ) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        if !recorder.is_recording(&frame.code, frame.depth) {
            return;
        }
        let status = if self.monitoring.any_active() {
            recorder.abort(AbortReason::Instrumented)
        } else {
            recorder.observe(&Observation {
                start,
                index,
                next: index + 1,
                opcode,
                oparg,
                stack: &frame.stack,
                globals: &frame.globals,
                builtins: &frame.builtins,
            })
        };
        match status {
            RecordStatus::Continue => {}
            RecordStatus::Complete(trace) => {
                self.recorder = None;
                self.install_trace(trace);
            }
            RecordStatus::Abort(reason) => {
                if let Some(recorder) = self.recorder.take() {
                    self.recording_failed(&recorder, &reason);
                }
            }
        }
    }

    /// Stop the current recording, charging its loop a miss
    pub(crate) fn abandon_recording(&mut self, reason: AbortReason) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.abort(reason.clone());
            self.recording_failed(&recorder, &reason);
        }
    }

    fn recording_failed(&mut self, recorder: &TraceRecorder, reason: &AbortReason) {
        self.stats.tier2.traces_aborted += 1;
        let cache = recorder.code().cache(recorder.origin());
        let misses = cache.record_miss();
        if misses >= self.config.max_specialization_misses {
            cache.disable();
            debug!(
                code = %recorder.code().qualname(),
                origin = recorder.origin(),
                %reason,
                "loop will not be traced again"
            );
        } else {
            cache.set_counter(self.config.backoff(misses));
        }
    }

    fn start_recording(&mut self, frame: &Frame, code: &Arc<CodeUnit>, origin: usize, entry: usize) {
        code.cache(origin)
            .set_counter(self.config.jump_backward_threshold);
        let mut recorder = TraceRecorder::start(
            Arc::clone(code),
            frame.depth,
            origin,
            entry,
            self.config.recorder_limits(),
        );
        let tag = self.monitoring.instrumentation_tag();
        recorder.depend_on(tag, tag.get());
        self.recorder = Some(recorder);
        self.stats.tier2.traces_started += 1;
    }

    fn install_trace(&mut self, trace: Trace) {
        self.stats.tier2.traces_completed += 1;
        let code = Arc::clone(trace.code());
        let origin = trace.origin();
        let executor = Arc::new(self.optimizer.optimize(trace));
        match code.install_executor(origin, executor) {
            Some(slot) => {
                self.stats.tier2.executors_installed += 1;
                debug!(code = %code.qualname(), origin, slot, "executor installed");
            }
            None => debug!(code = %code.qualname(), origin, "jump already replaced"),
        }
    }

    /// `JUMP_BACKWARD`: breaker check, hotness counting, then the jump
    pub(crate) fn jump_backward(
        &mut self,
        frame: &mut Frame,
        code: &Arc<CodeUnit>,
        start: usize,
        index: usize,
        target: usize,
    ) -> Result<(), Unwind> {
        self.handle_eval_breaker()?;
        frame.last_line = None;
        self.notify(frame, Event::Jump, || Payload::Jump {
            from: start,
            to: target,
        })?;
        if self.config.tier2
            && self.recorder.is_none()
            && !self.monitoring.any_active()
            && code.opcode_at(index) == Some(Opcode::JumpBackward)
            && specialize::tick(code.cache(index))
        {
            self.start_recording(frame, code, index, target);
        }
        frame.pc = target;
        Ok(())
    }

    /// `ENTER_EXECUTOR`: run the attached executor, or drop it when stale
    pub(crate) fn enter_executor(
        &mut self,
        frame: &mut Frame,
        code: &Arc<CodeUnit>,
        start: usize,
        index: usize,
        target: usize,
    ) -> Result<(), Unwind> {
        self.handle_eval_breaker()?;
        frame.last_line = None;
        self.notify(frame, Event::Jump, || Payload::Jump {
            from: start,
            to: target,
        })?;
        match code.executor_at(index) {
            Some(executor) if executor.is_valid() => {
                if self.config.tier2 && !self.monitoring.any_active() {
                    executor.record_entry();
                    self.stats.tier2.executor_entries += 1;
                    frame.pc = executor.entry() as usize;
                    return self.run_executor(frame, &executor);
                }
            }
            _ => {
                code.detach_executor(index);
                code.cache(index).set_counter(self.config.adaptive_cooldown);
                self.stats.tier2.invalidations += 1;
                debug!(code = %code.qualname(), origin = index, "stale executor detached");
            }
        }
        frame.pc = target;
        Ok(())
    }

    /// Run `executor` on `frame` until it leaves
    ///
    /// On return `frame.pc` is where tier-1 continues. Errors leave
    /// `frame.instr` at the instruction whose uop raised.
    pub(crate) fn run_executor(&mut self, frame: &mut Frame, executor: &Arc<Executor>) -> Result<(), Unwind> {
        let uops = executor.uops();
        let mut position = 0;
        loop {
            let Some(uop) = uops.get(position) else {
                return Err(FatalError::Internal("executor ran off its end".to_string()).into());
            };
            position += 1;
            frame.instr = uop.target as usize;
            match self.execute_uop(frame, executor, uop) {
                Ok(Step::Next) => {}
                Ok(Step::Restart) => {
                    if self.breaker.is_set() {
                        frame.pc = uop.target as usize;
                        return self.handle_eval_breaker();
                    }
                    position = 0;
                }
                Ok(Step::Exit(target)) => {
                    frame.pc = target as usize;
                    executor.record_side_exit();
                    self.stats.tier2.side_exits += 1;
                    trace!(
                        code = %frame.code.qualname(),
                        uop = %uop.id,
                        target,
                        "side exit"
                    );
                    return Ok(());
                }
                Err(error) => {
                    frame.pc = uop.target as usize;
                    return Err(error);
                }
            }
        }
    }

    fn execute_uop(
        &mut self,
        frame: &mut Frame,
        executor: &Executor,
        uop: &UopInstruction,
    ) -> Result<Step, Unwind> {
        let oparg = uop.oparg;
        let exit = Ok(Step::Exit(uop.target));
        match uop.id {
            UopId::Nop => {}
            UopId::CheckValidity => {
                if !executor.is_valid() {
                    return exit;
                }
            }
            UopId::JumpToTop => return Ok(Step::Restart),
            UopId::ExitTrace => return exit,

            // Guards
            UopId::GuardBothInt => {
                if !matches!((frame.peek(1), frame.peek(0)), (Some(Value::Int(_)), Some(Value::Int(_)))) {
                    return exit;
                }
            }
            UopId::GuardBothFloat => {
                if !matches!(
                    (frame.peek(1), frame.peek(0)),
                    (Some(Value::Float(_)), Some(Value::Float(_)))
                ) {
                    return exit;
                }
            }
            UopId::GuardBothUnicode => {
                if !matches!((frame.peek(1), frame.peek(0)), (Some(Value::Str(_)), Some(Value::Str(_)))) {
                    return exit;
                }
            }
            UopId::GuardTypeVersion => {
                let expected = uop.operand as u32;
                let ok = match frame.top() {
                    Some(Value::Instance(obj)) => obj.class().version_tag().matches(expected),
                    Some(Value::Type(class)) => class.version_tag().matches(expected),
                    _ => false,
                };
                if !ok {
                    return exit;
                }
            }
            UopId::GuardGlobalsVersion => {
                if !frame.globals.version_tag().matches(uop.operand as u32) {
                    return exit;
                }
            }
            UopId::GuardBuiltinsVersion => {
                if !frame.builtins.version_tag().matches(uop.operand as u32) {
                    return exit;
                }
            }
            UopId::GuardNotExhaustedRange => {
                if !matches!(frame.top(), Some(Value::RangeIter(it)) if !it.is_exhausted()) {
                    return exit;
                }
            }
            UopId::GuardNotExhaustedList => {
                if !matches!(frame.top(), Some(Value::ListIter(it)) if !it.is_exhausted()) {
                    return exit;
                }
            }
            UopId::GuardIsTruePop | UopId::GuardIsFalsePop => {
                let want = uop.id == UopId::GuardIsTruePop;
                if frame.top().map(Value::is_truthy) != Some(want) {
                    return exit;
                }
                frame.pop();
            }
            UopId::CheckFunctionExactArgs => {
                let ok = matches!(
                    frame.peek(oparg as usize),
                    Some(Value::Function(func)) if func.version() as u64 == uop.operand
                );
                if !ok {
                    return exit;
                }
            }

            // Loads and stores
            UopId::LoadFast => match local(frame, oparg as usize) {
                Some(value) => frame.push(value),
                None => return exit,
            },
            UopId::StoreFast => {
                let value = frame.pop();
                set_local(frame, oparg as usize, value);
            }
            UopId::LoadConst => {
                let value = Value::from_constant(constant_at(&frame.code, oparg)?);
                frame.push(value);
            }
            UopId::LoadConstInline => {
                let constant = executor.consts().get(oparg as usize).ok_or_else(|| {
                    Unwind::from(FatalError::Internal(format!("inline constant {} missing", oparg)))
                })?;
                frame.push(Value::from_constant(constant));
            }
            UopId::PopTop => {
                frame.pop();
            }
            UopId::Copy => {
                let value = frame
                    .peek((oparg as usize).saturating_sub(1))
                    .cloned()
                    .unwrap_or(Value::None);
                frame.push(value);
            }
            UopId::Swap => {
                let len = frame.stack.len();
                let n = oparg as usize;
                if (1..=len).contains(&n) {
                    frame.stack.swap(len - 1, len - n);
                }
            }
            UopId::LoadDeref => match load_deref(frame, oparg as usize) {
                Ok(value) => frame.push(value),
                Err(_) => return exit,
            },
            UopId::StoreDeref => {
                let value = frame.pop();
                store_deref(frame, oparg as usize, value);
            }

            // Arithmetic
            UopId::BinaryOp => {
                let op = BinaryOperator::from_oparg(oparg).ok_or_else(|| {
                    Unwind::from(FatalError::Internal(format!("unknown binary operator {}", oparg)))
                })?;
                let right = frame.pop();
                let left = frame.pop();
                frame.push(operations::binary_op(op, &left, &right)?);
            }
            UopId::BinaryOpAddInt
            | UopId::BinaryOpSubtractInt
            | UopId::BinaryOpMultiplyInt
            | UopId::GuardBothIntBinaryOpAddInt
            | UopId::GuardBothIntBinaryOpSubtractInt
            | UopId::GuardBothIntBinaryOpMultiplyInt => {
                let op = uop_operator(uop.id);
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => checked_int(op, *a, *b),
                    _ => None,
                };
                match result {
                    Some(value) => binary_result(frame, Value::Int(value)),
                    None => return exit,
                }
            }
            UopId::BinaryOpAddFloat
            | UopId::BinaryOpSubtractFloat
            | UopId::BinaryOpMultiplyFloat
            | UopId::GuardBothFloatBinaryOpAddFloat
            | UopId::GuardBothFloatBinaryOpSubtractFloat
            | UopId::GuardBothFloatBinaryOpMultiplyFloat => {
                let op = uop_operator(uop.id);
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Float(a)), Some(Value::Float(b))) => float_op(op, *a, *b),
                    _ => None,
                };
                match result {
                    Some(value) => binary_result(frame, Value::Float(value)),
                    None => return exit,
                }
            }
            UopId::BinaryOpAddUnicode | UopId::GuardBothUnicodeBinaryOpAddUnicode => {
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Str(a)), Some(Value::Str(b))) => Some(concat(a, b)),
                    _ => None,
                };
                match result {
                    Some(value) => binary_result(frame, value),
                    None => return exit,
                }
            }

            // Comparisons
            UopId::CompareOpInt => {
                let op = comparison(oparg)?;
                match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => {
                        let outcome = op.matches(a.cmp(b));
                        binary_result(frame, Value::Bool(outcome));
                    }
                    _ => return exit,
                }
            }
            UopId::CompareOpFloat => {
                let op = comparison(oparg)?;
                match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Float(a)), Some(Value::Float(b))) => {
                        let outcome = operations::compare_floats(op, *a, *b);
                        binary_result(frame, Value::Bool(outcome));
                    }
                    _ => return exit,
                }
            }
            UopId::CompareOpStr => {
                let op = comparison(oparg)?;
                match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Str(a)), Some(Value::Str(b))) => {
                        let outcome = op.matches(a.cmp(b));
                        binary_result(frame, Value::Bool(outcome));
                    }
                    _ => return exit,
                }
            }
            UopId::CompareOp => {
                let op = comparison(oparg)?;
                let right = frame.pop();
                let left = frame.pop();
                frame.push(Value::Bool(operations::compare(op, &left, &right)?));
            }
            UopId::UnaryNot => {
                let value = frame.pop();
                frame.push(Value::Bool(!value.is_truthy()));
            }
            UopId::UnaryNegative => {
                let value = frame.pop();
                frame.push(operations::negate(&value)?);
            }

            // Containers
            UopId::BuildTuple => {
                let items = frame.pop_n(oparg as usize);
                frame.push(Value::tuple(items));
            }
            UopId::BuildList => {
                let items = frame.pop_n(oparg as usize);
                frame.push(Value::list(items));
            }
            UopId::BinarySubscr => {
                let key = frame.pop();
                let container = frame.pop();
                frame.push(operations::subscript(&container, &key)?);
            }

            // Attributes
            UopId::LoadAttrInstanceValue => {
                let value = match frame.top() {
                    Some(Value::Instance(obj)) => obj.slot(oparg as usize),
                    _ => None,
                };
                match value {
                    Some(value) => replace_top(frame, value),
                    None => return exit,
                }
            }
            UopId::LoadAttrClass => {
                let name = name_at(&frame.code, oparg)?;
                let value = match frame.top() {
                    Some(Value::Type(class)) => class.class_attr(&name),
                    _ => None,
                };
                match value {
                    Some(value) => replace_top(frame, value),
                    None => return exit,
                }
            }
            UopId::LoadAttr => {
                let name = name_at(&frame.code, oparg)?;
                let owner = frame.pop();
                frame.push(operations::load_attr(&owner, &name)?);
            }
            UopId::StoreAttrInstanceValue => {
                let owner = match frame.top() {
                    Some(Value::Instance(obj)) => Some(std::rc::Rc::clone(obj)),
                    _ => None,
                };
                let Some(obj) = owner else {
                    return exit;
                };
                frame.pop();
                let value = frame.pop();
                obj.set_slot(oparg as usize, value);
            }
            UopId::StoreAttr => {
                let name = name_at(&frame.code, oparg)?;
                let owner = frame.pop();
                let value = frame.pop();
                operations::store_attr(&owner, &name, value)?;
            }

            // Globals
            UopId::LoadGlobalModule => match frame.globals.get_index(oparg as usize) {
                Some(value) => frame.push(value),
                None => return exit,
            },
            UopId::LoadGlobalBuiltin => match frame.builtins.get_index(oparg as usize) {
                Some(value) => frame.push(value),
                None => return exit,
            },
            UopId::LoadGlobal => {
                let name = name_at(&frame.code, oparg)?;
                let value = load_global(frame, &name)?;
                frame.push(value);
            }
            UopId::StoreGlobal => {
                let name = name_at(&frame.code, oparg)?;
                let value = frame.pop();
                frame.globals.insert(&name, value);
            }

            // Iteration and calls
            UopId::IterNextRange => {
                let item = match frame.top() {
                    Some(Value::RangeIter(it)) => it.next_value(),
                    _ => None,
                };
                match item {
                    Some(item) => frame.push(Value::Int(item)),
                    None => return exit,
                }
            }
            UopId::IterNextList => {
                let item = match frame.top() {
                    Some(Value::ListIter(it)) => it.next_value(),
                    _ => None,
                };
                match item {
                    Some(item) => frame.push(item),
                    None => return exit,
                }
            }
            UopId::Call => {
                let args = frame.pop_n(oparg as usize);
                let callee = frame.pop();
                let result = core_types::Interp::call_value(self, &callee, args)?;
                frame.push(result);
            }

            // Superinstructions
            UopId::LoadFastLoadFast => {
                let (first, second) = unpack_pair(oparg);
                let Some(a) = local(frame, first as usize) else {
                    return Ok(Step::Exit(uop.operand as u32));
                };
                frame.push(a);
                match local(frame, second as usize) {
                    Some(b) => frame.push(b),
                    None => return exit,
                }
            }
            UopId::StoreFastLoadFast => {
                let (first, second) = unpack_pair(oparg);
                let value = frame.pop();
                set_local(frame, first as usize, value);
                match local(frame, second as usize) {
                    Some(b) => frame.push(b),
                    None => return exit,
                }
            }
            UopId::LoadFastLoadFastGuardBothIntBinaryOpAddInt => {
                let (first, second) = unpack_pair(oparg);
                let Some(a) = local(frame, first as usize) else {
                    return Ok(Step::Exit((uop.operand >> 32) as u32));
                };
                frame.push(a);
                let Some(b) = local(frame, second as usize) else {
                    return Ok(Step::Exit(uop.operand as u32));
                };
                frame.push(b);
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => a.checked_add(*b),
                    _ => None,
                };
                match result {
                    Some(value) => binary_result(frame, Value::Int(value)),
                    None => return exit,
                }
            }
        }
        Ok(Step::Next)
    }
}

#[inline]
fn local(frame: &Frame, index: usize) -> Option<Value> {
    frame.locals.get(index).cloned().flatten()
}

#[inline]
fn set_local(frame: &mut Frame, index: usize, value: Value) {
    if let Some(slot) = frame.locals.get_mut(index) {
        *slot = Some(value);
    }
}

#[inline]
fn replace_top(frame: &mut Frame, value: Value) {
    if let Some(top) = frame.stack.last_mut() {
        *top = value;
    }
}

/// Replace the two operands with `value`
#[inline]
fn binary_result(frame: &mut Frame, value: Value) {
    frame.pop();
    replace_top(frame, value);
}

fn uop_operator(id: UopId) -> BinaryOperator {
    match id {
        UopId::BinaryOpSubtractInt
        | UopId::BinaryOpSubtractFloat
        | UopId::GuardBothIntBinaryOpSubtractInt
        | UopId::GuardBothFloatBinaryOpSubtractFloat => BinaryOperator::Subtract,
        UopId::BinaryOpMultiplyInt
        | UopId::BinaryOpMultiplyFloat
        | UopId::GuardBothIntBinaryOpMultiplyInt
        | UopId::GuardBothFloatBinaryOpMultiplyFloat => BinaryOperator::Multiply,
        _ => BinaryOperator::Add,
    }
}

fn comparison(oparg: u32) -> Result<bytecode_system::ComparisonOperator, Unwind> {
    bytecode_system::ComparisonOperator::from_oparg(oparg).ok_or_else(|| {
        FatalError::Internal(format!("unknown comparison {}", oparg)).into()
    })
}
