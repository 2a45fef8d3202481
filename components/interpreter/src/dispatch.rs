//! Tier-1: decode and execute one instruction
//!
//! Adaptive base forms count down and specialize themselves; specialized
//! forms check their guard and deoptimize back to the base form on a miss,
//! then run the generic path for that execution.

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{BinaryOperator, CacheCell, CodeUnit, ComparisonOperator, Constant, Opcode};
use core_types::{
    type_error, CellObj, Exception, ExceptionKind, FatalError, Function, Unwind, Value,
};

use crate::frame::Frame;
use crate::monitoring::legacy::is_native;
use crate::monitoring::{Event, Payload};
use crate::operations;
use crate::specialize;
use crate::vm::{undefined_name, unbound_local, Flow, Invocation, Vm};

fn internal(message: String) -> Unwind {
    FatalError::Internal(message).into()
}

/// Fold `EXTENDED_ARG` prefixes starting at `start`
///
/// Returns the opcode word's index, its opcode and the full operand.
fn decode(code: &CodeUnit, start: usize) -> Result<(usize, Opcode, u32), Unwind> {
    let mut index = start;
    let mut oparg = 0u32;
    loop {
        let inst = code.instruction(index).ok_or_else(|| {
            internal(format!("pc {} outside {}", index, code.qualname()))
        })?;
        oparg = (oparg << 8) | inst.oparg as u32;
        if inst.opcode != Opcode::ExtendedArg {
            return Ok((index, inst.opcode, oparg));
        }
        index += 1;
    }
}

fn jump_target(opcode: Opcode, next: usize, oparg: u32) -> Result<usize, Unwind> {
    opcode
        .jump_target(next, oparg)
        .ok_or_else(|| internal(format!("{} jumps outside the code unit", opcode)))
}

pub(crate) fn name_at(code: &CodeUnit, index: u32) -> Result<Arc<str>, Unwind> {
    code.names()
        .get(index as usize)
        .cloned()
        .ok_or_else(|| internal(format!("name index {} out of range", index)))
}

pub(crate) fn constant_at(code: &CodeUnit, index: u32) -> Result<&Constant, Unwind> {
    code.constants()
        .get(index as usize)
        .ok_or_else(|| internal(format!("constant index {} out of range", index)))
}

pub(crate) fn slot_name(code: &CodeUnit, index: usize) -> String {
    code.slots()
        .get(index)
        .map(|slot| slot.name.to_string())
        .unwrap_or_default()
}

/// Write through the cell in slot `index`, creating one if the slot holds none
pub(crate) fn store_deref(frame: &mut Frame, index: usize, value: Value) {
    let Some(slot) = frame.locals.get_mut(index) else {
        return;
    };
    if let Some(Value::Cell(cell)) = slot {
        cell.set(value);
    } else {
        *slot = Some(Value::Cell(CellObj::new(Some(value))));
    }
}

/// Value behind a free or cell variable
pub(crate) fn load_deref(frame: &Frame, index: usize) -> Result<Value, Unwind> {
    match frame.locals.get(index) {
        Some(Some(Value::Cell(cell))) => cell.get().ok_or_else(|| {
            Unwind::raise(
                ExceptionKind::NameError,
                format!(
                    "cannot access free variable '{}' where it is not associated with a value in enclosing scope",
                    slot_name(&frame.code, index)
                ),
            )
        }),
        Some(Some(value)) => Ok(value.clone()),
        _ => Err(unbound_local(&slot_name(&frame.code, index))),
    }
}

/// Module global, falling back to builtins
pub(crate) fn load_global(frame: &Frame, name: &str) -> Result<Value, Unwind> {
    frame
        .globals
        .get(name)
        .or_else(|| frame.builtins.get(name))
        .ok_or_else(|| undefined_name(name))
}

/// `a <op> b` on machine integers; `None` on overflow
#[inline]
pub(crate) fn checked_int(op: BinaryOperator, a: i64, b: i64) -> Option<i64> {
    match op {
        BinaryOperator::Add => a.checked_add(b),
        BinaryOperator::Subtract => a.checked_sub(b),
        BinaryOperator::Multiply => a.checked_mul(b),
        _ => None,
    }
}

#[inline]
pub(crate) fn float_op(op: BinaryOperator, a: f64, b: f64) -> Option<f64> {
    match op {
        BinaryOperator::Add => Some(a + b),
        BinaryOperator::Subtract => Some(a - b),
        BinaryOperator::Multiply => Some(a * b),
        _ => None,
    }
}

pub(crate) fn concat(a: &str, b: &str) -> Value {
    let mut text = String::with_capacity(a.len() + b.len());
    text.push_str(a);
    text.push_str(b);
    Value::Str(Rc::from(text))
}

fn specialized_operator(opcode: Opcode) -> BinaryOperator {
    match opcode {
        Opcode::BinaryOpSubtractInt | Opcode::BinaryOpSubtractFloat => BinaryOperator::Subtract,
        Opcode::BinaryOpMultiplyInt | Opcode::BinaryOpMultiplyFloat => BinaryOperator::Multiply,
        _ => BinaryOperator::Add,
    }
}

/// Exception object for a `raise` operand
pub(crate) fn to_exception(value: Value) -> Result<Rc<Exception>, Unwind> {
    match value {
        Value::Exception(exc) => Ok(exc),
        Value::ExceptionType(kind) => Ok(Exception::new(kind, "")),
        other => Err(type_error(format!(
            "exceptions must derive from BaseException, not {}",
            other.type_name()
        ))),
    }
}

fn closure_cells(value: &Value) -> Result<Vec<Rc<CellObj>>, Unwind> {
    let Value::Tuple(items) = value else {
        return Err(type_error("closure must be a tuple of cells"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Cell(cell) => Ok(Rc::clone(cell)),
            other => Err(type_error(format!(
                "closure item must be a cell, not {}",
                other.type_name()
            ))),
        })
        .collect()
}

#[inline]
fn replace_top(frame: &mut Frame, value: Value) {
    if let Some(top) = frame.stack.last_mut() {
        *top = value;
    }
}

impl Vm {
    /// Execute the instruction at `frame.pc`
    pub(crate) fn step(&mut self, frame: &mut Frame) -> Result<Flow, Unwind> {
        let code = Arc::clone(&frame.code);
        let start = frame.pc;
        let (index, opcode, oparg) = decode(&code, start)?;
        let next = index + 1;
        frame.instr = start;
        frame.pc = next;
        self.stats.instructions += 1;

        self.ticks += 1;
        if self.ticks >= self.config.tick_interval {
            self.ticks = 0;
            self.handle_eval_breaker()?;
        }
        if self.monitoring.any_active() {
            self.instrument(frame, start)?;
        }
        if self.recorder.is_some() {
            self.observe(frame, start, index, opcode, oparg);
        }

        match opcode {
            Opcode::Nop | Opcode::Resume => {}
            Opcode::ExtendedArg => {
                return Err(internal(format!("dangling EXTENDED_ARG at {}", index)));
            }
            Opcode::PopTop => {
                frame.pop();
            }
            Opcode::Copy => {
                let depth = (oparg as usize).saturating_sub(1);
                let value = frame.peek(depth).cloned().unwrap_or(Value::None);
                frame.push(value);
            }
            Opcode::Swap => {
                let len = frame.stack.len();
                let n = oparg as usize;
                if (1..=len).contains(&n) {
                    frame.stack.swap(len - 1, len - n);
                }
            }
            Opcode::LoadConst => {
                let value = Value::from_constant(constant_at(&code, oparg)?);
                frame.push(value);
            }
            Opcode::ReturnConst => {
                let value = Value::from_constant(constant_at(&code, oparg)?);
                return self.return_value(frame, value);
            }
            Opcode::ReturnValue => {
                let value = frame.pop();
                return self.return_value(frame, value);
            }

            // Locals and cells
            Opcode::LoadFast => {
                let value = frame.locals.get(oparg as usize).cloned().flatten();
                match value {
                    Some(value) => frame.push(value),
                    None => return Err(unbound_local(&slot_name(&code, oparg as usize))),
                }
            }
            Opcode::StoreFast => {
                let value = frame.pop();
                if let Some(slot) = frame.locals.get_mut(oparg as usize) {
                    *slot = Some(value);
                }
            }
            Opcode::DeleteFast => {
                let removed = frame.locals.get_mut(oparg as usize).and_then(Option::take);
                if removed.is_none() {
                    return Err(unbound_local(&slot_name(&code, oparg as usize)));
                }
            }
            Opcode::MakeCell => {
                if let Some(slot) = frame.locals.get_mut(oparg as usize) {
                    let cell = match slot.take() {
                        Some(Value::Cell(cell)) => cell,
                        other => CellObj::new(other),
                    };
                    *slot = Some(Value::Cell(cell));
                }
            }
            Opcode::LoadDeref => {
                let value = load_deref(frame, oparg as usize)?;
                frame.push(value);
            }
            Opcode::StoreDeref => {
                let value = frame.pop();
                store_deref(frame, oparg as usize, value);
            }

            // Globals
            Opcode::LoadGlobal => {
                let name = name_at(&code, oparg)?;
                self.adapt(&code, index, opcode, |cache| {
                    specialize::load_global(cache, &name, &frame.globals, &frame.builtins)
                });
                let value = load_global(frame, &name)?;
                frame.push(value);
            }
            Opcode::LoadGlobalModule => {
                let cache = code.cache(index).global();
                let hit = if frame.globals.version_tag().matches(cache.module_version) {
                    frame.globals.get_index(cache.index as usize)
                } else {
                    None
                };
                match hit {
                    Some(value) => frame.push(value),
                    None => {
                        self.deoptimize(&code, index, opcode);
                        let value = load_global(frame, &name_at(&code, oparg)?)?;
                        frame.push(value);
                    }
                }
            }
            Opcode::LoadGlobalBuiltin => {
                let cache = code.cache(index).global();
                let hit = if frame.globals.version_tag().matches(cache.module_version)
                    && frame.builtins.version_tag().matches(cache.builtins_version)
                {
                    frame.builtins.get_index(cache.index as usize)
                } else {
                    None
                };
                match hit {
                    Some(value) => frame.push(value),
                    None => {
                        self.deoptimize(&code, index, opcode);
                        let value = load_global(frame, &name_at(&code, oparg)?)?;
                        frame.push(value);
                    }
                }
            }
            Opcode::StoreGlobal => {
                let name = name_at(&code, oparg)?;
                let value = frame.pop();
                frame.globals.insert(&name, value);
            }

            // Attributes
            Opcode::LoadAttr => {
                let name = name_at(&code, oparg)?;
                self.adapt(&code, index, opcode, |cache| {
                    frame
                        .top()
                        .and_then(|owner| specialize::load_attr(cache, owner, &name))
                });
                self.load_attr_generic(frame, &name)?;
            }
            Opcode::LoadAttrInstanceValue => {
                let attr = code.cache(index).attr();
                let hit = match frame.top() {
                    Some(Value::Instance(obj))
                        if obj.class().version_tag().matches(attr.type_version) =>
                    {
                        obj.slot(attr.index as usize)
                    }
                    _ => None,
                };
                match hit {
                    Some(value) => replace_top(frame, value),
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.load_attr_generic(frame, &name_at(&code, oparg)?)?;
                    }
                }
            }
            Opcode::LoadAttrClass => {
                let name = name_at(&code, oparg)?;
                let attr = code.cache(index).attr();
                let hit = match frame.top() {
                    Some(Value::Type(class)) if class.version_tag().matches(attr.type_version) => {
                        class.class_attr(&name)
                    }
                    _ => None,
                };
                match hit {
                    Some(value) => replace_top(frame, value),
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.load_attr_generic(frame, &name)?;
                    }
                }
            }
            Opcode::StoreAttr => {
                let name = name_at(&code, oparg)?;
                self.adapt(&code, index, opcode, |cache| {
                    frame
                        .top()
                        .and_then(|owner| specialize::store_attr(cache, owner, &name))
                });
                self.store_attr_generic(frame, &name)?;
            }
            Opcode::StoreAttrInstanceValue => {
                let attr = code.cache(index).attr();
                let owner = match frame.top() {
                    Some(Value::Instance(obj))
                        if obj.class().version_tag().matches(attr.type_version) =>
                    {
                        Some(Rc::clone(obj))
                    }
                    _ => None,
                };
                match owner {
                    Some(obj) => {
                        frame.pop();
                        let value = frame.pop();
                        obj.set_slot(attr.index as usize, value);
                    }
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.store_attr_generic(frame, &name_at(&code, oparg)?)?;
                    }
                }
            }

            // Arithmetic
            Opcode::BinaryOp => {
                self.adapt(&code, index, opcode, |_| match (frame.peek(1), frame.peek(0)) {
                    (Some(left), Some(right)) => specialize::binary_op(oparg, left, right),
                    _ => None,
                });
                self.binary_op_generic(frame, oparg)?;
            }
            Opcode::BinaryOpAddInt | Opcode::BinaryOpSubtractInt | Opcode::BinaryOpMultiplyInt => {
                let op = specialized_operator(opcode);
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => Some(checked_int(op, *a, *b)),
                    _ => None,
                };
                match result {
                    Some(Some(value)) => {
                        frame.pop();
                        replace_top(frame, Value::Int(value));
                    }
                    // Overflow: same types, so the specialization stays.
                    Some(None) => self.binary_op_generic(frame, oparg)?,
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.binary_op_generic(frame, oparg)?;
                    }
                }
            }
            Opcode::BinaryOpAddFloat
            | Opcode::BinaryOpSubtractFloat
            | Opcode::BinaryOpMultiplyFloat => {
                let op = specialized_operator(opcode);
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Float(a)), Some(Value::Float(b))) => float_op(op, *a, *b),
                    _ => None,
                };
                match result {
                    Some(value) => {
                        frame.pop();
                        replace_top(frame, Value::Float(value));
                    }
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.binary_op_generic(frame, oparg)?;
                    }
                }
            }
            Opcode::BinaryOpAddUnicode => {
                let result = match (frame.peek(1), frame.peek(0)) {
                    (Some(Value::Str(a)), Some(Value::Str(b))) => Some(concat(a, b)),
                    _ => None,
                };
                match result {
                    Some(value) => {
                        frame.pop();
                        replace_top(frame, value);
                    }
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.binary_op_generic(frame, oparg)?;
                    }
                }
            }
            Opcode::UnaryNegative => {
                let value = frame.pop();
                frame.push(operations::negate(&value)?);
            }
            Opcode::UnaryNot => {
                let value = frame.pop();
                frame.push(Value::Bool(!value.is_truthy()));
            }

            // Comparisons
            Opcode::CompareOp => {
                self.adapt(&code, index, opcode, |_| match (frame.peek(1), frame.peek(0)) {
                    (Some(left), Some(right)) => specialize::compare_op(left, right),
                    _ => None,
                });
                self.compare_op_generic(frame, oparg)?;
            }
            Opcode::CompareOpInt | Opcode::CompareOpFloat | Opcode::CompareOpStr => {
                let op = comparison(oparg)?;
                let result = match (opcode, frame.peek(1), frame.peek(0)) {
                    (Opcode::CompareOpInt, Some(Value::Int(a)), Some(Value::Int(b))) => {
                        Some(op.matches(a.cmp(b)))
                    }
                    (Opcode::CompareOpFloat, Some(Value::Float(a)), Some(Value::Float(b))) => {
                        Some(operations::compare_floats(op, *a, *b))
                    }
                    (Opcode::CompareOpStr, Some(Value::Str(a)), Some(Value::Str(b))) => {
                        Some(op.matches(a.cmp(b)))
                    }
                    _ => None,
                };
                match result {
                    Some(outcome) => {
                        frame.pop();
                        replace_top(frame, Value::Bool(outcome));
                    }
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.compare_op_generic(frame, oparg)?;
                    }
                }
            }

            // Containers
            Opcode::BuildTuple => {
                let items = frame.pop_n(oparg as usize);
                frame.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = frame.pop_n(oparg as usize);
                frame.push(Value::list(items));
            }
            Opcode::BinarySubscr => {
                let key = frame.pop();
                let container = frame.pop();
                frame.push(operations::subscript(&container, &key)?);
            }

            // Iteration
            Opcode::GetIter => {
                let value = frame.pop();
                frame.push(operations::get_iter(&value)?);
            }
            Opcode::ForIter => {
                self.adapt(&code, index, opcode, |_| frame.top().and_then(specialize::for_iter));
                let target = jump_target(opcode, next, oparg)?;
                self.for_iter_generic(frame, start, next, target)?;
            }
            Opcode::ForIterRange | Opcode::ForIterList => {
                let target = jump_target(opcode, next, oparg)?;
                let item = match (opcode, frame.top()) {
                    (Opcode::ForIterRange, Some(Value::RangeIter(it))) => {
                        Some(it.next_value().map(Value::Int))
                    }
                    (Opcode::ForIterList, Some(Value::ListIter(it))) => Some(it.next_value()),
                    _ => None,
                };
                match item {
                    Some(item) => self.finish_for_iter(frame, item, start, next, target)?,
                    None => {
                        self.deoptimize(&code, index, opcode);
                        self.for_iter_generic(frame, start, next, target)?;
                    }
                }
            }

            // Control flow
            Opcode::JumpForward => {
                let target = jump_target(opcode, next, oparg)?;
                self.notify(frame, Event::Jump, || Payload::Jump {
                    from: start,
                    to: target,
                })?;
                frame.pc = target;
            }
            Opcode::JumpBackward => {
                let target = jump_target(opcode, next, oparg)?;
                self.jump_backward(frame, &code, start, index, target)?;
            }
            Opcode::EnterExecutor => {
                let target = jump_target(opcode, next, oparg)?;
                self.enter_executor(frame, &code, start, index, target)?;
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let target = jump_target(opcode, next, oparg)?;
                let condition = frame.pop();
                let taken = condition.is_truthy() == (opcode == Opcode::PopJumpIfTrue);
                let destination = if taken { target } else { next };
                self.notify(frame, Event::Branch, || Payload::Jump {
                    from: start,
                    to: destination,
                })?;
                frame.pc = destination;
            }

            // Calls and functions
            Opcode::Call => {
                self.adapt(&code, index, opcode, |cache| {
                    frame
                        .peek(oparg as usize)
                        .and_then(|callee| specialize::call(cache, callee, oparg))
                });
                return self.call_generic(frame, oparg as usize);
            }
            Opcode::CallPyExactArgs => {
                let expected = code.cache(index).call().func_version;
                let func = match frame.peek(oparg as usize) {
                    Some(Value::Function(func)) if func.version() == expected => Some(Rc::clone(func)),
                    _ => None,
                };
                let Some(func) = func else {
                    self.deoptimize(&code, index, opcode);
                    return self.call_generic(frame, oparg as usize);
                };
                let args = frame.pop_n(oparg as usize);
                let callee = frame.pop();
                self.notify(frame, Event::Call, || Payload::Call {
                    offset: start,
                    callable: callee.clone(),
                    arg0: args.first().cloned().unwrap_or(Value::None),
                })?;
                return match self.function_frame(&func, args)? {
                    Invocation::Frame(callee) => Ok(Flow::Call(callee)),
                    Invocation::Done(value) => {
                        frame.push(value);
                        Ok(Flow::Continue)
                    }
                };
            }
            Opcode::MakeFunction => {
                let code_value = frame.pop();
                let closure = if oparg & 1 != 0 {
                    closure_cells(&frame.pop())?
                } else {
                    Vec::new()
                };
                let body = match code_value {
                    Value::Code(body) => body,
                    other => {
                        return Err(type_error(format!(
                            "cannot make a function from {}",
                            other.type_name()
                        )))
                    }
                };
                let func = Function::new(
                    body,
                    Rc::clone(&frame.globals),
                    Rc::clone(&frame.builtins),
                    closure,
                );
                frame.push(Value::Function(func));
            }
            Opcode::YieldValue => {
                let value = frame.pop();
                self.notify(frame, Event::PyYield, || Payload::Return {
                    offset: start,
                    value: value.clone(),
                })?;
                return Ok(Flow::Yield(value));
            }

            // Exceptions
            Opcode::RaiseVarargs => {
                if oparg == 0 {
                    return Err(Unwind::raise(
                        ExceptionKind::RuntimeError,
                        "No active exception to reraise",
                    ));
                }
                let value = frame.pop();
                return Err(Unwind::Exception(to_exception(value)?));
            }
            Opcode::Reraise => {
                let exc = to_exception(frame.pop())?;
                self.notify(frame, Event::Reraise, || Payload::Exception {
                    offset: start,
                    exc: Value::Exception(Rc::clone(&exc)),
                })?;
                self.reraising = true;
                return Err(Unwind::Exception(exc));
            }
            Opcode::CheckExcMatch => {
                let pattern = frame.pop();
                let exc = frame.top().cloned().unwrap_or(Value::None);
                frame.push(Value::Bool(operations::exception_matches(&exc, &pattern)?));
            }
        }
        Ok(Flow::Continue)
    }

    /// Fire `event` if some tool listens, building the payload only then
    #[inline]
    pub(crate) fn notify(
        &mut self,
        frame: &mut Frame,
        event: Event,
        payload: impl FnOnce() -> Payload,
    ) -> Result<(), Unwind> {
        if self.monitoring.is_active(event) {
            self.fire(frame, event, payload())
        } else {
            Ok(())
        }
    }

    /// `LINE` and `INSTRUCTION` events before an instruction
    fn instrument(&mut self, frame: &mut Frame, start: usize) -> Result<(), Unwind> {
        if self.monitoring.is_active(Event::Line) {
            let line = frame.code.line_for(start);
            if let Some(line) = line {
                if frame.last_line != Some(line) {
                    frame.last_line = Some(line);
                    self.fire(frame, Event::Line, Payload::Line { line })?;
                }
            }
        }
        self.notify(frame, Event::Instruction, || Payload::At { offset: start })
    }

    /// Act on whatever other threads asked for
    pub(crate) fn handle_eval_breaker(&mut self) -> Result<(), Unwind> {
        if !self.breaker.is_set() {
            return Ok(());
        }
        if self.breaker.take_drop_request() {
            if let Some(lock) = self.lock.clone() {
                lock.yield_to_waiters(&self.breaker);
            }
        }
        for call in self.breaker.take_pending_calls() {
            call(self)?;
        }
        if self.breaker.take_interrupt() {
            return Err(Unwind::raise(ExceptionKind::KeyboardInterrupt, ""));
        }
        Ok(())
    }

    /// Count an adaptive execution and specialize once the counter runs out
    #[inline]
    fn adapt(
        &mut self,
        code: &CodeUnit,
        index: usize,
        base: Opcode,
        choose: impl FnOnce(&CacheCell) -> Option<Opcode>,
    ) {
        if !self.config.specialization {
            return;
        }
        let cache = code.cache(index);
        if specialize::tick(cache) {
            let chosen = choose(cache);
            specialize::commit(
                code,
                index,
                base,
                chosen,
                &self.config,
                &mut self.stats.specialization,
            );
        }
    }

    fn deoptimize(&mut self, code: &CodeUnit, index: usize, specialized: Opcode) {
        specialize::deoptimize(
            code,
            index,
            specialized,
            &self.config,
            &mut self.stats.specialization,
        );
    }

    fn return_value(&mut self, frame: &mut Frame, value: Value) -> Result<Flow, Unwind> {
        let offset = frame.instr;
        self.notify(frame, Event::PyReturn, || Payload::Return {
            offset,
            value: value.clone(),
        })?;
        Ok(Flow::Return(value))
    }

    fn load_attr_generic(&mut self, frame: &mut Frame, name: &str) -> Result<(), Unwind> {
        let owner = frame.pop();
        frame.push(operations::load_attr(&owner, name)?);
        Ok(())
    }

    fn store_attr_generic(&mut self, frame: &mut Frame, name: &str) -> Result<(), Unwind> {
        let owner = frame.pop();
        let value = frame.pop();
        operations::store_attr(&owner, name, value)
    }

    fn binary_op_generic(&mut self, frame: &mut Frame, oparg: u32) -> Result<(), Unwind> {
        let op = BinaryOperator::from_oparg(oparg)
            .ok_or_else(|| internal(format!("unknown binary operator {}", oparg)))?;
        let right = frame.pop();
        let left = frame.pop();
        frame.push(operations::binary_op(op, &left, &right)?);
        Ok(())
    }

    fn compare_op_generic(&mut self, frame: &mut Frame, oparg: u32) -> Result<(), Unwind> {
        let op = comparison(oparg)?;
        let right = frame.pop();
        let left = frame.pop();
        frame.push(Value::Bool(operations::compare(op, &left, &right)?));
        Ok(())
    }

    fn for_iter_generic(
        &mut self,
        frame: &mut Frame,
        start: usize,
        next: usize,
        target: usize,
    ) -> Result<(), Unwind> {
        let iterator = frame.top().cloned().unwrap_or(Value::None);
        let item = match operations::next_native(&iterator) {
            Some(item) => item,
            None => match &iterator {
                Value::Generator(gen) => {
                    let item = self.resume_generator(gen)?;
                    if item.is_none() {
                        self.notify(frame, Event::StopIteration, || Payload::Exception {
                            offset: start,
                            exc: Value::Exception(Exception::new(ExceptionKind::StopIteration, "")),
                        })?;
                    }
                    item
                }
                other => {
                    return Err(type_error(format!(
                        "'{}' object is not an iterator",
                        other.type_name()
                    )))
                }
            },
        };
        self.finish_for_iter(frame, item, start, next, target)
    }

    /// Push the next item, or drop the exhausted iterator and leave the loop
    fn finish_for_iter(
        &mut self,
        frame: &mut Frame,
        item: Option<Value>,
        start: usize,
        next: usize,
        target: usize,
    ) -> Result<(), Unwind> {
        let destination = match item {
            Some(value) => {
                frame.push(value);
                next
            }
            None => {
                frame.pop();
                frame.pc = target;
                target
            }
        };
        self.notify(frame, Event::Branch, || Payload::Jump {
            from: start,
            to: destination,
        })
    }

    /// Generic `CALL`: `[callable, args...]` on the stack
    fn call_generic(&mut self, frame: &mut Frame, argc: usize) -> Result<Flow, Unwind> {
        let args = frame.pop_n(argc);
        let callee = frame.pop();
        let payload = if self.monitoring.any_active() {
            Some(Payload::Call {
                offset: frame.instr,
                callable: callee.clone(),
                arg0: args.first().cloned().unwrap_or(Value::None),
            })
        } else {
            None
        };
        if let Some(payload) = &payload {
            self.notify(frame, Event::Call, || payload.clone())?;
        }

        let outcome = self.invoke(&callee, args);
        if let Some(payload) = payload.filter(|_| is_native(&callee)) {
            match &outcome {
                Ok(_) => self.notify(frame, Event::CReturn, || payload)?,
                Err(Unwind::Exception(_)) => self.notify(frame, Event::CRaise, || payload)?,
                Err(Unwind::Fatal(_)) => {}
            }
        }
        match outcome? {
            Invocation::Frame(callee) => Ok(Flow::Call(callee)),
            Invocation::Done(value) => {
                frame.push(value);
                Ok(Flow::Continue)
            }
        }
    }
}

fn comparison(oparg: u32) -> Result<ComparisonOperator, Unwind> {
    ComparisonOperator::from_oparg(oparg)
        .ok_or_else(|| internal(format!("unknown comparison {}", oparg)))
}
