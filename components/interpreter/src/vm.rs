//! The interpreter: frame chains, calls, unwinding and event delivery
//!
//! Instruction semantics live in `dispatch` and the executor runtime in
//! `tier2`; both extend [`Vm`] with further `impl` blocks.

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::CodeUnit;
use core_types::{
    type_error, value_error, Exception, ExceptionKind, FatalError, Function, Generator, Instance,
    Interp, Namespace, Unwind, Value,
};
use trace_optimizer::{AbortReason, OptimizerPasses, TraceOptimizer, TraceRecorder};
use tracing::{debug, trace};

use crate::builtins;
use crate::config::EngineConfig;
use crate::error::{EngineError, MonitoringError};
use crate::eval_breaker::{EvalBreaker, InterpreterLock};
use crate::frame::{Frame, FrameState};
use crate::monitoring::legacy::{self, LegacyHooks, PROFILE_REGISTRANT, TRACE_REGISTRANT};
use crate::monitoring::{Event, Handler, Monitoring, Payload, PROFILER_ID, TRACER_ID};
use crate::operations;
use crate::stats::EngineStats;

/// What one instruction asks of the run loop
pub(crate) enum Flow {
    Continue,
    Call(Box<Frame>),
    Return(Value),
    Yield(Value),
}

/// How a frame chain left [`Vm::run_frame`]
pub(crate) enum FrameExit {
    Return(Value),
    Yield(Value, Box<Frame>),
}

/// Result of preparing a call
pub(crate) enum Invocation {
    /// A bytecode frame to push
    Frame(Box<Frame>),
    /// Native callee that already produced its result
    Done(Value),
}

/// Tiered bytecode interpreter
///
/// One `Vm` runs on one thread at a time. Several `Vm`s may share code units
/// (quickened instructions, caches and executors are shared through them)
/// and serialize on an [`InterpreterLock`].
pub struct Vm {
    pub(crate) config: EngineConfig,
    pub(crate) globals: Rc<Namespace>,
    pub(crate) builtins: Rc<Namespace>,
    pub(crate) monitoring: Monitoring,
    pub(crate) legacy: LegacyHooks,
    pub(crate) breaker: Arc<EvalBreaker>,
    pub(crate) lock: Option<Arc<InterpreterLock>>,
    pub(crate) recorder: Option<TraceRecorder>,
    pub(crate) optimizer: TraceOptimizer,
    pub(crate) stats: EngineStats,
    /// Active frames across every nested run loop
    pub(crate) depth: usize,
    /// Stack position of the outermost run loop
    pub(crate) native_base: usize,
    /// Instructions since the last periodic breaker check
    pub(crate) ticks: u32,
    /// Set while a tool callback runs; no events fire meanwhile
    pub(crate) in_hook: bool,
    /// Set by `RERAISE` so the unwinder neither extends the traceback nor
    /// fires `RAISE` again
    pub(crate) reraising: bool,
    output: Option<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Interpreter with the default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Interpreter with an explicit configuration
    pub fn with_config(config: EngineConfig) -> Self {
        let builtin_ns = Namespace::new();
        builtins::install(&builtin_ns);
        debug!(
            specialization = config.specialization,
            tier2 = config.tier2,
            "interpreter created"
        );
        Self {
            config,
            globals: Namespace::new(),
            builtins: builtin_ns,
            monitoring: Monitoring::new(),
            legacy: LegacyHooks::default(),
            breaker: Arc::new(EvalBreaker::new()),
            lock: None,
            recorder: None,
            optimizer: TraceOptimizer::new(),
            stats: EngineStats::default(),
            depth: 0,
            native_base: 0,
            ticks: 0,
            in_hook: false,
            reraising: false,
            output: None,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Choose which optimizer passes run on traces recorded from now on
    ///
    /// Optimizer counters restart from zero.
    pub fn set_optimizer_passes(&mut self, passes: OptimizerPasses) {
        self.optimizer = TraceOptimizer::with_passes(passes);
    }

    /// Module namespace top-level code runs in
    pub fn globals(&self) -> &Rc<Namespace> {
        &self.globals
    }

    /// Builtins namespace
    pub fn builtins(&self) -> &Rc<Namespace> {
        &self.builtins
    }

    /// Flags other threads use to interrupt this interpreter
    pub fn eval_breaker(&self) -> Arc<EvalBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Run under `lock`, releasing it to waiters at periodic ticks
    pub fn set_interpreter_lock(&mut self, lock: Arc<InterpreterLock>) {
        self.lock = Some(lock);
    }

    /// Event registry
    pub fn monitoring(&self) -> &Monitoring {
        &self.monitoring
    }

    /// Event registry, for registering tools
    pub fn monitoring_mut(&mut self) -> &mut Monitoring {
        &mut self.monitoring
    }

    /// Counters so far
    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats;
        stats.optimizer = self.optimizer.stats();
        stats
    }

    /// Collect program output in memory instead of writing to stdout
    pub fn capture_output(&mut self) {
        self.output.get_or_insert_with(String::new);
    }

    /// Output collected since the last call
    pub fn take_output(&mut self) -> String {
        self.output.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Execute `code` as top-level code in the module namespace
    pub fn run(&mut self, code: &Arc<CodeUnit>) -> Result<Value, EngineError> {
        let frame = Box::new(Frame::new(
            Arc::clone(code),
            Rc::clone(&self.globals),
            Rc::clone(&self.builtins),
        ));
        let outermost = self.depth == 0;
        let lock = if outermost { self.lock.clone() } else { None };
        let _guard = lock.as_ref().map(|lock| lock.hold(&self.breaker));
        let result = self.run_frame(frame);
        if outermost {
            self.reset_after_run();
        }
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(..) => {
                Err(FatalError::Internal("top-level code yielded".to_string()).into())
            }
        }
    }

    /// Call a guest callable from the host
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, EngineError> {
        let outermost = self.depth == 0;
        let lock = if outermost { self.lock.clone() } else { None };
        let _guard = lock.as_ref().map(|lock| lock.hold(&self.breaker));
        let result = self.call_value(callee, args);
        if outermost {
            self.reset_after_run();
        }
        Ok(result?)
    }

    fn reset_after_run(&mut self) {
        if self.recorder.is_some() {
            self.abandon_recording(AbortReason::FrameExited);
        }
        self.in_hook = false;
        self.reraising = false;
    }

    /// Install (or with `None` remove) a legacy profile function
    pub fn set_profile(&mut self, func: Option<Value>) -> Result<(), MonitoringError> {
        match func {
            Some(func) => {
                self.monitoring.register(
                    PROFILER_ID,
                    PROFILE_REGISTRANT,
                    legacy::profile_events(),
                    Handler::LegacyProfile,
                )?;
                self.legacy.profile = Some(func);
            }
            None => {
                if self.monitoring.get_tool(PROFILER_ID) == Some(PROFILE_REGISTRANT) {
                    self.monitoring.free_tool_id(PROFILER_ID)?;
                }
                self.legacy.profile = None;
            }
        }
        Ok(())
    }

    /// Install (or with `None` remove) a legacy trace function
    pub fn set_trace(&mut self, func: Option<Value>) -> Result<(), MonitoringError> {
        match func {
            Some(func) => {
                self.monitoring.register(
                    TRACER_ID,
                    TRACE_REGISTRANT,
                    legacy::trace_events(self.legacy.trace_opcodes),
                    Handler::LegacyTrace,
                )?;
                self.legacy.trace = Some(func);
            }
            None => {
                if self.monitoring.get_tool(TRACER_ID) == Some(TRACE_REGISTRANT) {
                    self.monitoring.free_tool_id(TRACER_ID)?;
                }
                self.legacy.trace = None;
            }
        }
        Ok(())
    }

    /// Deliver per-instruction `opcode` events to the trace function
    pub fn set_trace_opcodes(&mut self, enabled: bool) -> Result<(), MonitoringError> {
        self.legacy.trace_opcodes = enabled;
        if self.legacy.trace.is_some() {
            self.monitoring
                .set_events(TRACER_ID, legacy::trace_events(enabled))?;
        }
        Ok(())
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Run `frame` and everything it calls until it returns or yields
    pub(crate) fn run_frame(&mut self, frame: Box<Frame>) -> Result<FrameExit, Unwind> {
        let here = stack_position();
        if self.depth == 0 {
            self.native_base = here;
        } else if self.native_base.abs_diff(here) > self.config.max_native_stack {
            return Err(FatalError::NativeStackExhausted(self.config.max_native_stack).into());
        }
        let base = self.depth;
        let result = self.run_chain(frame);
        self.depth = base;
        result
    }

    fn run_chain(&mut self, mut frame: Box<Frame>) -> Result<FrameExit, Unwind> {
        loop {
            let flow = if frame.state == FrameState::Running {
                self.step(&mut frame)
            } else {
                self.start_frame(&mut frame).map(|()| Flow::Continue)
            };
            let flow = match flow {
                Ok(flow) => flow,
                Err(unwind) => {
                    self.propagate(&mut frame, unwind)?;
                    continue;
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Call(mut callee) => {
                    std::mem::swap(&mut frame, &mut callee);
                    frame.previous = Some(callee);
                }
                Flow::Return(value) => {
                    self.leave_frame(&frame);
                    frame.state = FrameState::Completed;
                    match frame.previous.take() {
                        Some(caller) => {
                            frame = caller;
                            self.depth -= 1;
                            frame.push(value);
                        }
                        None => return Ok(FrameExit::Return(value)),
                    }
                }
                Flow::Yield(value) => {
                    self.leave_frame(&frame);
                    frame.state = FrameState::Suspended;
                    if frame.previous.is_some() {
                        return Err(FatalError::Internal(
                            "generator frame is not the base of its chain".to_string(),
                        )
                        .into());
                    }
                    return Ok(FrameExit::Yield(value, frame));
                }
            }
        }
    }

    /// Enter a new or resumed frame
    fn start_frame(&mut self, frame: &mut Frame) -> Result<(), Unwind> {
        let limit = self.config.max_recursion_depth;
        if self.depth >= limit {
            return Err(FatalError::RecursionLimit(limit).into());
        }
        self.depth += 1;
        frame.depth = self.depth;
        let resumed = frame.state == FrameState::Suspended;
        frame.state = FrameState::Running;
        if self.config.specialization || self.config.tier2 {
            frame.code.quicken(
                self.config.adaptive_warmup,
                self.config.jump_backward_threshold,
            );
        }
        if resumed {
            // Value sent into the generator.
            frame.push(Value::None);
            let offset = frame.pc;
            self.fire(frame, Event::PyResume, Payload::At { offset })
        } else {
            self.fire(frame, Event::PyStart, Payload::At { offset: 0 })
        }
    }

    fn leave_frame(&mut self, frame: &Frame) {
        if self.is_recording(frame) {
            self.abandon_recording(AbortReason::FrameExited);
        }
    }

    /// Unwind `unwind` through the chain until a handler takes it
    ///
    /// Returns `Ok` with `frame` positioned at the handler, or the error once
    /// the chain's base frame has been left.
    fn propagate(&mut self, frame: &mut Box<Frame>, mut unwind: Unwind) -> Result<(), Unwind> {
        loop {
            match self.handle_exception(frame, unwind) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    frame.state = FrameState::Completed;
                    match frame.previous.take() {
                        Some(caller) => {
                            *frame = caller;
                            self.depth -= 1;
                            unwind = error;
                        }
                        None => return Err(error),
                    }
                }
            }
        }
    }

    /// Look for a handler for `unwind` in `frame`
    fn handle_exception(&mut self, frame: &mut Frame, unwind: Unwind) -> Result<(), Unwind> {
        let mut exc = match unwind {
            Unwind::Exception(exc) => exc,
            fatal @ Unwind::Fatal(_) => {
                self.leave_frame(frame);
                return Err(fatal);
            }
        };
        if !std::mem::take(&mut self.reraising) {
            exc.push_traceback(frame.traceback_entry());
            let payload = Payload::Exception {
                offset: frame.instr,
                exc: Value::Exception(Rc::clone(&exc)),
            };
            match self.fire(frame, Event::Raise, payload) {
                Ok(()) => {}
                Err(Unwind::Exception(replacement)) => exc = replacement,
                Err(fatal) => return Err(fatal),
            }
        }
        if self.is_recording(frame) {
            self.abandon_recording(AbortReason::Exception);
        }

        let Some(entry) = frame.code.handler_for(frame.instr).copied() else {
            let payload = Payload::Exception {
                offset: frame.instr,
                exc: Value::Exception(Rc::clone(&exc)),
            };
            return match self.fire(frame, Event::PyUnwind, payload) {
                Ok(()) => Err(Unwind::Exception(exc)),
                Err(other) => Err(other),
            };
        };
        trace!(code = %frame.code.qualname(), at = frame.instr, target = entry.target, "exception handled");
        frame.stack.truncate(entry.depth as usize);
        if entry.lasti {
            frame.push(Value::Int(frame.instr as i64));
        }
        frame.push(Value::Exception(Rc::clone(&exc)));
        frame.pc = entry.target as usize;
        frame.instr = entry.target as usize;
        let payload = Payload::Exception {
            offset: entry.target as usize,
            exc: Value::Exception(exc),
        };
        match self.fire(frame, Event::ExceptionHandled, payload) {
            Ok(()) => Ok(()),
            Err(error) => self.handle_exception(frame, error),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Resolve a call: a frame to push, or the result of a native callee
    pub(crate) fn invoke(&mut self, callee: &Value, mut args: Vec<Value>) -> Result<Invocation, Unwind> {
        match callee {
            Value::Function(func) => self.function_frame(func, args),
            Value::BoundMethod(method) => {
                args.insert(0, method.receiver.clone());
                let function = method.function.clone();
                self.invoke(&function, args)
            }
            Value::Builtin(builtin) => {
                let builtin = Rc::clone(builtin);
                builtin.call(self, &args).map(Invocation::Done)
            }
            Value::Type(class) => {
                let obj = Instance::new(class);
                if let Some(init) = class.class_attr("__init__") {
                    args.insert(0, Value::Instance(Rc::clone(&obj)));
                    let result = self.call_value(&init, args)?;
                    if !matches!(result, Value::None) {
                        return Err(type_error(format!(
                            "__init__() should return None, not '{}'",
                            result.type_name()
                        )));
                    }
                } else if !args.is_empty() {
                    return Err(type_error(format!("{}() takes no arguments", class.name())));
                }
                Ok(Invocation::Done(Value::Instance(obj)))
            }
            Value::ExceptionType(kind) => {
                let message = args.first().map(ToString::to_string).unwrap_or_default();
                Ok(Invocation::Done(Value::Exception(Exception::new(*kind, message))))
            }
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    /// Frame for a bytecode function, or a fresh generator for a generator
    /// function
    pub(crate) fn function_frame(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
    ) -> Result<Invocation, Unwind> {
        let code = func.code();
        let mut frame = Box::new(Frame::new(
            Arc::clone(code),
            Rc::clone(func.globals()),
            Rc::clone(func.builtins()),
        ));
        let given = args.len();
        if !frame.bind_arguments(args) {
            return Err(type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                func.name(),
                code.arg_count(),
                given
            )));
        }
        frame.bind_closure(func.closure());
        if code.is_generator() {
            return Ok(Invocation::Done(Value::Generator(Generator::new(
                func.name(),
                frame,
            ))));
        }
        Ok(Invocation::Frame(frame))
    }

    /// Run a suspended generator to its next yield
    pub(crate) fn resume_generator(&mut self, gen: &Rc<Generator>) -> Result<Option<Value>, Unwind> {
        if gen.is_finished() {
            return Ok(None);
        }
        let Some(boxed) = gen.take_frame() else {
            return Err(value_error("generator already executing"));
        };
        let frame = boxed
            .downcast::<Frame>()
            .map_err(|_| FatalError::Internal("generator holds a foreign frame".to_string()))?;
        match self.run_frame(frame) {
            Ok(FrameExit::Yield(value, frame)) => {
                gen.suspend(frame);
                Ok(Some(value))
            }
            Ok(FrameExit::Return(_)) => {
                gen.finish();
                Ok(None)
            }
            Err(error) => {
                gen.finish();
                Err(error)
            }
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Deliver `event` to every tool listening for it
    ///
    /// A callback that raises makes the event site raise.
    pub(crate) fn fire(&mut self, frame: &mut Frame, event: Event, payload: Payload) -> Result<(), Unwind> {
        if self.in_hook || !self.monitoring.is_active(event) {
            return Ok(());
        }
        let handlers = self.monitoring.handlers(event);
        if handlers.is_empty() {
            return Ok(());
        }
        self.in_hook = true;
        let result = self.run_handlers(frame, event, &payload, handlers.into_iter().map(|(_, h)| h));
        self.in_hook = false;
        result
    }

    fn run_handlers(
        &mut self,
        frame: &mut Frame,
        event: Event,
        payload: &Payload,
        handlers: impl Iterator<Item = Handler>,
    ) -> Result<(), Unwind> {
        for handler in handlers {
            match handler {
                Handler::Object(callback) => {
                    self.call_value(&callback, payload.args(&frame.code))?;
                }
                Handler::LegacyProfile => {
                    let Some(profile) = self.legacy.profile.clone() else {
                        continue;
                    };
                    if let Some((name, arg)) = legacy::profile_event(event, payload) {
                        self.call_value(&profile, vec![Value::str(name), arg])?;
                    }
                }
                Handler::LegacyTrace => {
                    let Some(tracer) = self.legacy.trace.clone() else {
                        continue;
                    };
                    let opcodes = self.legacy.trace_opcodes;
                    let call = legacy::trace_event(
                        event,
                        payload,
                        &frame.code,
                        &mut frame.last_traced_line,
                        opcodes,
                    );
                    if let Some(call) = call {
                        self.call_value(&tracer, call.args(&frame.code))?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Interp for Vm {
    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, Unwind> {
        match self.invoke(callee, args)? {
            Invocation::Done(value) => Ok(value),
            Invocation::Frame(frame) => match self.run_frame(frame)? {
                FrameExit::Return(value) => Ok(value),
                FrameExit::Yield(..) => Err(FatalError::Internal(
                    "plain function frame yielded".to_string(),
                )
                .into()),
            },
        }
    }

    fn next_item(&mut self, iterator: &Value) -> Result<Option<Value>, Unwind> {
        if let Some(item) = operations::next_native(iterator) {
            return Ok(item);
        }
        match iterator {
            Value::Generator(gen) => self.resume_generator(gen),
            other => Err(type_error(format!(
                "'{}' object is not an iterator",
                other.type_name()
            ))),
        }
    }

    fn iterate(&mut self, value: &Value) -> Result<Value, Unwind> {
        operations::get_iter(value)
    }

    fn write_output(&mut self, text: &str) {
        match &mut self.output {
            Some(buffer) => buffer.push_str(text),
            None => print!("{}", text),
        }
    }
}

/// Approximate address of the caller's native stack frame
#[inline(never)]
fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Exception for an unbound local
pub(crate) fn unbound_local(name: &str) -> Unwind {
    Unwind::raise(
        ExceptionKind::UnboundLocalError,
        format!(
            "cannot access local variable '{}' where it is not associated with a value",
            name
        ),
    )
}

/// Exception for a missing global
pub(crate) fn undefined_name(name: &str) -> Unwind {
    Unwind::raise(
        ExceptionKind::NameError,
        format!("name '{}' is not defined", name),
    )
}
