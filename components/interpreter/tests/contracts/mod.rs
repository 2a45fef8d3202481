//! Contract tests for the interpreter's public surface
//!
//! These pin the observable behavior embedders and tools rely on: event
//! streams, tool registration and the legacy hooks.

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{BinaryOperator, CodeBuilder, CodeUnit, Constant, Opcode};
use core_types::{type_error, Builtin, BuiltinFn, Function, Interp, Unwind, Value};
use interpreter::monitoring::{COVERAGE_ID, DEBUGGER_ID, PROFILER_ID, TRACER_ID};
use interpreter::{EngineConfig, EngineError, Event, EventSet, MonitoringError, Vm};

fn function(vm: &Vm, code: Arc<CodeUnit>) -> Value {
    Value::Function(Function::new(
        code,
        Rc::clone(vm.globals()),
        Rc::clone(vm.builtins()),
        Vec::new(),
    ))
}

fn builtin(name: &'static str, func: BuiltinFn) -> Value {
    Value::Builtin(Builtin::new(name, func))
}

fn code_name(value: Option<&Value>) -> String {
    match value {
        Some(Value::Code(code)) => code.name().to_string(),
        _ => "?".to_string(),
    }
}

fn arg(args: &[Value], index: usize) -> String {
    args.get(index).map(|v| v.repr()).unwrap_or_default()
}

fn on_start(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    interp.write_output(&format!("PY_START {}\n", code_name(args.first())));
    Ok(Value::None)
}

fn on_return(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    interp.write_output(&format!(
        "PY_RETURN {} {}\n",
        code_name(args.first()),
        arg(args, 2)
    ));
    Ok(Value::None)
}

fn on_line(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    interp.write_output(&format!("LINE {}\n", arg(args, 1)));
    Ok(Value::None)
}

fn on_jump(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    interp.write_output(&format!("JUMP {}->{}\n", arg(args, 1), arg(args, 2)));
    Ok(Value::None)
}

fn on_branch(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    interp.write_output(&format!("BRANCH {}->{}\n", arg(args, 1), arg(args, 2)));
    Ok(Value::None)
}

fn on_exception(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    let kind = match args.get(2) {
        Some(Value::Exception(exc)) => exc.kind().name(),
        _ => "?",
    };
    interp.write_output(&format!("EXC {} at {}\n", kind, arg(args, 1)));
    Ok(Value::None)
}

fn failing(_: &mut dyn Interp, _: &[Value]) -> Result<Value, Unwind> {
    Err(type_error("tool callback failed"))
}

fn profile_fn(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    if let Some(Value::Str(event)) = args.first() {
        interp.write_output(&format!("{}\n", event));
    }
    Ok(Value::None)
}

fn trace_fn(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    if let Some(Value::Str(event)) = args.get(2) {
        interp.write_output(&format!("{} {}\n", event, arg(args, 1)));
    }
    Ok(Value::None)
}

fn watch(vm: &mut Vm, tool: u8, hooks: &[(Event, Value)]) {
    let monitoring = vm.monitoring_mut();
    monitoring.use_tool_id(tool, "test-tool").unwrap();
    let mut events = EventSet::EMPTY;
    for (event, callback) in hooks {
        monitoring
            .register_callback(tool, *event, Some(callback.clone()))
            .unwrap();
        events = events.with(*event);
    }
    monitoring.set_events(tool, events).unwrap();
}

/// `def sum_range(n)` over `range(n)` with one source line per statement
fn sum_range_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("sum_range");
    b.arg_count(1);
    let n = b.add_local("n");
    let total = b.add_local("total");
    let i = b.add_local("i");
    let zero = b.add_constant(Constant::Int(0));
    let range = b.add_name("range");
    let (top, end) = (b.new_label(), b.new_label());
    b.set_line(1);
    b.emit(Opcode::LoadConst, zero);
    b.emit(Opcode::StoreFast, total);
    b.set_line(2);
    b.emit(Opcode::LoadGlobal, range);
    b.emit(Opcode::LoadFast, n);
    b.emit(Opcode::Call, 1);
    b.emit(Opcode::GetIter, 0);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, end);
    b.emit(Opcode::StoreFast, i);
    b.set_line(3);
    b.emit(Opcode::LoadFast, total);
    b.emit(Opcode::LoadFast, i);
    b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    b.emit(Opcode::StoreFast, total);
    b.emit_jump(Opcode::JumpBackward, top);
    b.bind(end);
    b.set_line(4);
    b.emit(Opcode::LoadFast, total);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

/// `def two(): return 1 + 1` spread over two lines
fn two_line_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("two");
    let one = b.add_constant(Constant::Int(1));
    b.set_line(1);
    b.emit(Opcode::LoadConst, one);
    b.emit(Opcode::LoadConst, one);
    b.set_line(2);
    b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

fn event_stream(config: EngineConfig, calls: usize) -> String {
    let mut vm = Vm::with_config(config);
    vm.capture_output();
    let f = function(&vm, sum_range_code());
    // Warm up before any tool is attached.
    for _ in 0..calls {
        vm.call(&f, vec![Value::Int(20)]).unwrap();
    }
    watch(
        &mut vm,
        COVERAGE_ID,
        &[
            (Event::Line, builtin("on_line", on_line)),
            (Event::Jump, builtin("on_jump", on_jump)),
            (Event::Branch, builtin("on_branch", on_branch)),
        ],
    );
    assert_eq!(vm.call(&f, vec![Value::Int(3)]).unwrap(), Value::Int(3));
    vm.take_output()
}

// ============================================================================
// Tool registration
// ============================================================================

/// Test that a claimed tool id cannot be taken by another registrant
#[test]
fn test_tool_id_conflict() {
    let mut vm = Vm::new();
    vm.monitoring_mut().use_tool_id(DEBUGGER_ID, "pdb").unwrap();
    let err = vm
        .monitoring_mut()
        .use_tool_id(DEBUGGER_ID, "other")
        .unwrap_err();
    assert_eq!(
        err,
        MonitoringError::Conflict {
            tool: DEBUGGER_ID,
            holder: "pdb".to_string()
        }
    );
    assert_eq!(vm.monitoring().get_tool(DEBUGGER_ID), Some("pdb"));
}

/// Test that tool ids outside the table are rejected
#[test]
fn test_invalid_tool_id() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.monitoring_mut().use_tool_id(8, "x"),
        Err(MonitoringError::InvalidTool(8))
    );
}

/// Test that events cannot be set for an unclaimed tool
#[test]
fn test_set_events_requires_claim() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.monitoring_mut()
            .set_events(COVERAGE_ID, EventSet::of(&[Event::Line])),
        Err(MonitoringError::ToolNotInUse(COVERAGE_ID))
    );
}

/// Test that changing the event mask moves the instrumentation version
#[test]
fn test_event_change_bumps_instrumentation_tag() {
    let mut vm = Vm::new();
    let before = vm.monitoring().instrumentation_tag().get();
    watch(&mut vm, COVERAGE_ID, &[(Event::Line, builtin("on_line", on_line))]);
    assert_ne!(vm.monitoring().instrumentation_tag().get(), before);
    assert!(vm.monitoring().is_active(Event::Line));
    assert!(!vm.monitoring().is_active(Event::Jump));
}

/// Test that the legacy profile hook refuses a foreign holder of its slot
#[test]
fn test_set_profile_conflicts_with_foreign_tool() {
    let mut vm = Vm::new();
    vm.monitoring_mut().use_tool_id(PROFILER_ID, "cProfile").unwrap();
    let result = vm.set_profile(Some(builtin("profile_fn", profile_fn)));
    assert!(matches!(result, Err(MonitoringError::Conflict { .. })));
}

/// Test that clearing the trace hook frees its slot
#[test]
fn test_set_trace_none_frees_slot() {
    let mut vm = Vm::new();
    vm.set_trace(Some(builtin("trace_fn", trace_fn))).unwrap();
    assert!(vm.monitoring().get_tool(TRACER_ID).is_some());
    vm.set_trace(None).unwrap();
    assert!(vm.monitoring().get_tool(TRACER_ID).is_none());
    assert!(!vm.monitoring().any_active());
}

// ============================================================================
// Event streams
// ============================================================================

/// Test that start and return events nest with calls
#[test]
fn test_start_and_return_events_nest() {
    let mut vm = Vm::new();
    vm.capture_output();
    let inner = function(&vm, two_line_code());
    vm.globals().insert("two", inner);

    let mut b = CodeBuilder::new("outer");
    let name = b.add_name("two");
    b.emit(Opcode::LoadGlobal, name);
    b.emit(Opcode::Call, 0);
    b.emit(Opcode::ReturnValue, 0);
    let outer = function(&vm, b.build().unwrap());

    watch(
        &mut vm,
        COVERAGE_ID,
        &[
            (Event::PyStart, builtin("on_start", on_start)),
            (Event::PyReturn, builtin("on_return", on_return)),
        ],
    );
    vm.call(&outer, vec![]).unwrap();
    assert_eq!(
        vm.take_output(),
        "PY_START outer\nPY_START two\nPY_RETURN two 2\nPY_RETURN outer 2\n"
    );
}

/// Test that a line event fires once per line change
#[test]
fn test_line_events() {
    let mut vm = Vm::new();
    vm.capture_output();
    let two = function(&vm, two_line_code());
    watch(&mut vm, COVERAGE_ID, &[(Event::Line, builtin("on_line", on_line))]);
    vm.call(&two, vec![]).unwrap();
    assert_eq!(vm.take_output(), "LINE 1\nLINE 2\n");
}

/// Test that a loop reports each back edge and each iterator branch
#[test]
fn test_loop_events() {
    let stream = event_stream(EngineConfig::default(), 0);
    let jumps = stream.lines().filter(|l| l.starts_with("JUMP")).count();
    let branches = stream.lines().filter(|l| l.starts_with("BRANCH")).count();
    assert_eq!(jumps, 3);
    assert_eq!(branches, 4);
}

/// Test that specialized and traced code reports the same events as generic code
#[test]
fn test_event_stream_independent_of_tier() {
    let generic = event_stream(EngineConfig::no_specialization(), 0);
    assert_eq!(event_stream(EngineConfig::default(), 20), generic);
    assert_eq!(event_stream(EngineConfig::eager(), 20), generic);
}

/// Test that raise and handled events report a caught exception
#[test]
fn test_exception_events() {
    let mut b = CodeBuilder::new("div");
    b.arg_count(1);
    let x = b.add_local("x");
    let ten = b.add_constant(Constant::Int(10));
    let fallback = b.add_constant(Constant::Int(-1));
    let (start, end, handler) = (b.new_label(), b.new_label(), b.new_label());
    b.bind(start);
    b.emit(Opcode::LoadConst, ten);
    b.emit(Opcode::LoadFast, x);
    b.emit(Opcode::BinaryOp, BinaryOperator::FloorDivide as u32);
    b.emit(Opcode::ReturnValue, 0);
    b.bind(end);
    b.bind(handler);
    b.emit(Opcode::PopTop, 0);
    b.emit(Opcode::LoadConst, fallback);
    b.emit(Opcode::ReturnValue, 0);
    b.add_handler(start, end, handler, 0, false);

    let mut vm = Vm::new();
    vm.capture_output();
    let div = function(&vm, b.build().unwrap());
    watch(
        &mut vm,
        COVERAGE_ID,
        &[
            (Event::Raise, builtin("on_exception", on_exception)),
            (Event::ExceptionHandled, builtin("on_exception", on_exception)),
        ],
    );
    assert_eq!(vm.call(&div, vec![Value::Int(0)]).unwrap(), Value::Int(-1));
    assert_eq!(
        vm.take_output(),
        "EXC ZeroDivisionError at 2\nEXC ZeroDivisionError at 4\n"
    );
}

/// Test that an exception raised by a tool callback propagates into the guest
#[test]
fn test_callback_error_propagates() {
    let mut vm = Vm::new();
    let two = function(&vm, two_line_code());
    watch(&mut vm, COVERAGE_ID, &[(Event::PyStart, builtin("failing", failing))]);
    match vm.call(&two, vec![]) {
        Err(EngineError::Uncaught(exc)) => assert_eq!(exc.message(), "tool callback failed"),
        other => panic!("expected callback failure, got {:?}", other),
    }
    vm.monitoring_mut()
        .register_callback(COVERAGE_ID, Event::PyStart, None)
        .unwrap();
    assert_eq!(vm.call(&two, vec![]).unwrap(), Value::Int(2));
}

// ============================================================================
// Legacy hooks
// ============================================================================

/// Test the classic profile event sequence around a native call
#[test]
fn test_profile_hook_sequence() {
    let mut b = CodeBuilder::new("f");
    let len = b.add_name("len");
    let text = b.add_constant(Constant::Str("abc".into()));
    b.emit(Opcode::LoadGlobal, len);
    b.emit(Opcode::LoadConst, text);
    b.emit(Opcode::Call, 1);
    b.emit(Opcode::ReturnValue, 0);

    let mut vm = Vm::new();
    vm.capture_output();
    let f = function(&vm, b.build().unwrap());
    vm.set_profile(Some(builtin("profile_fn", profile_fn))).unwrap();
    assert_eq!(vm.call(&f, vec![]).unwrap(), Value::Int(3));
    assert_eq!(vm.take_output(), "call\nc_call\nc_return\nreturn\n");
}

/// Test the classic trace event sequence with line numbers
#[test]
fn test_trace_hook_sequence() {
    let mut vm = Vm::new();
    vm.capture_output();
    let two = function(&vm, two_line_code());
    vm.set_trace(Some(builtin("trace_fn", trace_fn))).unwrap();
    assert_eq!(vm.call(&two, vec![]).unwrap(), Value::Int(2));
    assert_eq!(vm.take_output(), "call 1\nline 1\nline 2\nreturn 2\n");
}
