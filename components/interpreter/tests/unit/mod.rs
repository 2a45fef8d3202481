//! Unit tests for interpreter components

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{
    BinaryOperator, CodeBuilder, CodeUnit, ComparisonOperator, Constant, Opcode, SlotKind,
};
use core_types::{
    ExceptionKind, FatalError, Function, Instance, Interp, TypeObject, Unwind, Value,
};
use interpreter::{EngineConfig, EngineError, Vm};
use trace_optimizer::OptimizerPasses;

fn function(vm: &Vm, code: Arc<CodeUnit>) -> Value {
    Value::Function(Function::new(
        code,
        Rc::clone(vm.globals()),
        Rc::clone(vm.builtins()),
        Vec::new(),
    ))
}

/// `def add(a, b): return a + b`
fn add_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("add");
    b.arg_count(2);
    let x = b.add_local("a");
    let y = b.add_local("b");
    b.emit(Opcode::LoadFast, x);
    b.emit(Opcode::LoadFast, y);
    b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

/// `def sum_range(n): total = 0; for i in range(n): total = total + i; return total`
fn sum_range_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("sum_range");
    b.arg_count(1);
    let n = b.add_local("n");
    let total = b.add_local("total");
    let i = b.add_local("i");
    let zero = b.add_constant(Constant::Int(0));
    let range = b.add_name("range");
    let (top, end) = (b.new_label(), b.new_label());
    b.emit(Opcode::LoadConst, zero);
    b.emit(Opcode::StoreFast, total);
    b.emit(Opcode::LoadGlobal, range);
    b.emit(Opcode::LoadFast, n);
    b.emit(Opcode::Call, 1);
    b.emit(Opcode::GetIter, 0);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, end);
    b.emit(Opcode::StoreFast, i);
    b.emit(Opcode::LoadFast, total);
    b.emit(Opcode::LoadFast, i);
    b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    b.emit(Opcode::StoreFast, total);
    b.emit_jump(Opcode::JumpBackward, top);
    b.bind(end);
    b.emit(Opcode::LoadFast, total);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

/// `def div(x): try: return 10 // x  except ZeroDivisionError: return -1`
fn guarded_div_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("div");
    b.arg_count(1);
    let x = b.add_local("x");
    let ten = b.add_constant(Constant::Int(10));
    let minus_one = b.add_constant(Constant::Int(-1));
    let zde = b.add_name("ZeroDivisionError");
    let (start, end, handler, reraise) = (b.new_label(), b.new_label(), b.new_label(), b.new_label());
    b.bind(start);
    b.emit(Opcode::LoadConst, ten);
    b.emit(Opcode::LoadFast, x);
    b.emit(Opcode::BinaryOp, BinaryOperator::FloorDivide as u32);
    b.emit(Opcode::ReturnValue, 0);
    b.bind(end);
    b.bind(handler);
    b.emit(Opcode::LoadGlobal, zde);
    b.emit(Opcode::CheckExcMatch, 0);
    b.emit_jump(Opcode::PopJumpIfFalse, reraise);
    b.emit(Opcode::PopTop, 0);
    b.emit(Opcode::LoadConst, minus_one);
    b.emit(Opcode::ReturnValue, 0);
    b.bind(reraise);
    b.emit(Opcode::Reraise, 0);
    b.add_handler(start, end, handler, 0, false);
    b.build().unwrap()
}

/// `def squares(n): for i in range(n): yield i * i`
fn squares_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("squares");
    b.arg_count(1).generator();
    let n = b.add_local("n");
    let i = b.add_local("i");
    let range = b.add_name("range");
    let none = b.add_constant(Constant::None);
    let (top, end) = (b.new_label(), b.new_label());
    b.emit(Opcode::LoadGlobal, range);
    b.emit(Opcode::LoadFast, n);
    b.emit(Opcode::Call, 1);
    b.emit(Opcode::GetIter, 0);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, end);
    b.emit(Opcode::StoreFast, i);
    b.emit(Opcode::LoadFast, i);
    b.emit(Opcode::LoadFast, i);
    b.emit(Opcode::BinaryOp, BinaryOperator::Multiply as u32);
    b.emit(Opcode::YieldValue, 0);
    b.emit(Opcode::PopTop, 0);
    b.emit_jump(Opcode::JumpBackward, top);
    b.bind(end);
    b.emit(Opcode::ReturnConst, none);
    b.build().unwrap()
}

/// `def f(): return f()`
fn runaway_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("f");
    let f = b.add_name("f");
    b.emit(Opcode::LoadGlobal, f);
    b.emit(Opcode::Call, 0);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

/// `def cmp(a, b): return a <op> b`
fn compare_code(op: ComparisonOperator) -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("cmp");
    b.arg_count(2);
    let a = b.add_local("a");
    let c = b.add_local("b");
    b.emit(Opcode::LoadFast, a);
    b.emit(Opcode::LoadFast, c);
    b.emit(Opcode::CompareOp, op as u32);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

/// ```text
/// def fold(items, acc):
///     below = None
///     for x in items:
///         acc = acc + x
///         below = x < acc
///     return (acc, below)
/// ```
fn fold_code() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("fold");
    b.arg_count(2);
    let items = b.add_local("items");
    let acc = b.add_local("acc");
    let x = b.add_local("x");
    let below = b.add_local("below");
    let none = b.add_constant(Constant::None);
    let (top, end) = (b.new_label(), b.new_label());
    b.emit(Opcode::LoadConst, none);
    b.emit(Opcode::StoreFast, below);
    b.emit(Opcode::LoadFast, items);
    b.emit(Opcode::GetIter, 0);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, end);
    b.emit(Opcode::StoreFast, x);
    b.emit(Opcode::LoadFast, acc);
    b.emit(Opcode::LoadFast, x);
    b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    b.emit(Opcode::StoreFast, acc);
    b.emit(Opcode::LoadFast, x);
    b.emit(Opcode::LoadFast, acc);
    b.emit(Opcode::CompareOp, ComparisonOperator::Less as u32);
    b.emit(Opcode::StoreFast, below);
    b.emit_jump(Opcode::JumpBackward, top);
    b.bind(end);
    b.emit(Opcode::LoadFast, acc);
    b.emit(Opcode::LoadFast, below);
    b.emit(Opcode::BuildTuple, 2);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

fn uncaught_kind(result: Result<Value, EngineError>) -> ExceptionKind {
    match result {
        Err(EngineError::Uncaught(exc)) => exc.kind(),
        other => panic!("expected an uncaught exception, got {:?}", other),
    }
}

// ============================================================================
// Execution
// ============================================================================

#[test]
fn test_call_function_with_arguments() {
    let mut vm = Vm::new();
    let add = function(&vm, add_code());
    let result = vm.call(&add, vec![Value::Int(2), Value::Int(40)]).unwrap();
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_wrong_arity_is_type_error() {
    let mut vm = Vm::new();
    let add = function(&vm, add_code());
    let result = vm.call(&add, vec![Value::Int(2)]);
    assert_eq!(uncaught_kind(result), ExceptionKind::TypeError);
}

#[test]
fn test_integer_overflow_promotes() {
    let mut vm = Vm::new();
    let add = function(&vm, add_code());
    let result = vm.call(&add, vec![Value::Int(i64::MAX), Value::Int(1)]).unwrap();
    assert!(matches!(result, Value::BigInt(_)));
}

#[test]
fn test_loop_sums_range() {
    for config in [
        EngineConfig::no_specialization(),
        EngineConfig::default(),
        EngineConfig::eager(),
    ] {
        let mut vm = Vm::with_config(config);
        let f = function(&vm, sum_range_code());
        assert_eq!(vm.call(&f, vec![Value::Int(100)]).unwrap(), Value::Int(4950));
    }
}

#[test]
fn test_handler_catches_matching_exception() {
    let mut vm = Vm::new();
    let div = function(&vm, guarded_div_code());
    assert_eq!(vm.call(&div, vec![Value::Int(5)]).unwrap(), Value::Int(2));
    assert_eq!(vm.call(&div, vec![Value::Int(0)]).unwrap(), Value::Int(-1));
}

#[test]
fn test_reraise_keeps_single_traceback_entry() {
    let mut vm = Vm::new();
    let div = function(&vm, guarded_div_code());
    match vm.call(&div, vec![Value::str("x")]) {
        Err(EngineError::Uncaught(exc)) => {
            assert_eq!(exc.kind(), ExceptionKind::TypeError);
            assert_eq!(exc.traceback().len(), 1);
        }
        other => panic!("expected TypeError, got {:?}", other),
    }
}

#[test]
fn test_traceback_spans_frames() {
    let mut vm = Vm::new();
    let mut inner = CodeBuilder::new("inner");
    let one = inner.add_constant(Constant::Int(1));
    let zero = inner.add_constant(Constant::Int(0));
    inner.emit(Opcode::LoadConst, one);
    inner.emit(Opcode::LoadConst, zero);
    inner.emit(Opcode::BinaryOp, BinaryOperator::TrueDivide as u32);
    inner.emit(Opcode::ReturnValue, 0);
    let inner = function(&vm, inner.build().unwrap());
    vm.globals().insert("inner", inner);

    let mut outer = CodeBuilder::new("outer");
    let name = outer.add_name("inner");
    outer.emit(Opcode::LoadGlobal, name);
    outer.emit(Opcode::Call, 0);
    outer.emit(Opcode::ReturnValue, 0);
    let outer = function(&vm, outer.build().unwrap());

    match vm.call(&outer, vec![]) {
        Err(EngineError::Uncaught(exc)) => {
            assert_eq!(exc.kind(), ExceptionKind::ZeroDivisionError);
            let names: Vec<String> = exc.traceback().iter().map(|e| e.name.to_string()).collect();
            assert_eq!(names, vec!["inner".to_string(), "outer".to_string()]);
        }
        other => panic!("expected ZeroDivisionError, got {:?}", other),
    }
}

#[test]
fn test_recursion_limit_is_fatal() {
    let mut vm = Vm::with_config(EngineConfig::default().with_max_recursion_depth(50));
    let f = function(&vm, runaway_code());
    vm.globals().insert("f", f.clone());
    match vm.call(&f, vec![]) {
        Err(EngineError::Fatal(FatalError::RecursionLimit(limit))) => assert_eq!(limit, 50),
        other => panic!("expected recursion limit, got {:?}", other),
    }
    // The interpreter stays usable afterwards.
    let add = function(&vm, add_code());
    assert_eq!(vm.call(&add, vec![Value::Int(1), Value::Int(1)]).unwrap(), Value::Int(2));
}

/// `class C: def __init__(self): C()`
fn self_constructing_class(vm: &Vm) -> Rc<TypeObject> {
    let mut b = CodeBuilder::new("__init__");
    b.arg_count(1);
    b.add_local("self");
    let c = b.add_name("C");
    let none = b.add_constant(Constant::None);
    b.emit(Opcode::LoadGlobal, c);
    b.emit(Opcode::Call, 0);
    b.emit(Opcode::PopTop, 0);
    b.emit(Opcode::ReturnConst, none);
    let class = TypeObject::new("C");
    class.set_class_attr("__init__", function(vm, b.build().unwrap()));
    vm.globals().insert("C", Value::Type(Rc::clone(&class)));
    class
}

#[test]
fn test_recursion_through_init_is_fatal_at_default_limits() {
    let mut vm = Vm::new();
    let class = self_constructing_class(&vm);
    // Whichever budget runs out first, the call fails instead of the process.
    match vm.call(&Value::Type(Rc::clone(&class)), vec![]) {
        Err(EngineError::Fatal(FatalError::NativeStackExhausted(budget))) => {
            assert_eq!(budget, EngineConfig::default().max_native_stack);
        }
        Err(EngineError::Fatal(FatalError::RecursionLimit(limit))) => {
            assert_eq!(limit, EngineConfig::default().max_recursion_depth);
        }
        other => panic!("expected a recursion failure, got {:?}", other),
    }
    assert_eq!(class.live_instances(), 0);
    let add = function(&vm, add_code());
    assert_eq!(vm.call(&add, vec![Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));
}

#[test]
fn test_native_stack_budget_is_configurable() {
    let mut vm = Vm::with_config(EngineConfig::default().with_max_native_stack(16 * 1024));
    let class = self_constructing_class(&vm);
    assert!(matches!(
        vm.call(&Value::Type(class), vec![]),
        Err(EngineError::Fatal(FatalError::NativeStackExhausted(16384)))
    ));
}

#[test]
fn test_generator_yields_lazily() {
    let mut vm = Vm::new();
    let squares = function(&vm, squares_code());
    let gen = vm.call(&squares, vec![Value::Int(4)]).unwrap();
    assert!(matches!(gen, Value::Generator(_)));
    assert_eq!(vm.next_item(&gen).unwrap(), Some(Value::Int(0)));
    assert_eq!(vm.next_item(&gen).unwrap(), Some(Value::Int(1)));
    let list = vm.builtins().get("list").unwrap();
    let rest = vm.call(&list, vec![gen.clone()]).unwrap();
    assert_eq!(rest, Value::list(vec![Value::Int(4), Value::Int(9)]));
    assert_eq!(vm.next_item(&gen).unwrap(), None);
}

#[test]
fn test_closure_reads_enclosing_cell() {
    let mut inner = CodeBuilder::new("inner");
    let x = inner.add_slot("x", SlotKind::FREE);
    inner.emit(Opcode::LoadDeref, x);
    inner.emit(Opcode::ReturnValue, 0);
    let inner = inner.build().unwrap();

    let mut outer = CodeBuilder::new("outer");
    let x = outer.add_slot("x", SlotKind::CELL);
    let five = outer.add_constant(Constant::Int(5));
    let body = outer.add_constant(Constant::Code(inner));
    outer.emit(Opcode::MakeCell, x);
    outer.emit(Opcode::LoadConst, five);
    outer.emit(Opcode::StoreDeref, x);
    outer.emit(Opcode::LoadFast, x);
    outer.emit(Opcode::BuildTuple, 1);
    outer.emit(Opcode::LoadConst, body);
    outer.emit(Opcode::MakeFunction, 1);
    outer.emit(Opcode::Call, 0);
    outer.emit(Opcode::ReturnValue, 0);

    let mut vm = Vm::new();
    assert_eq!(vm.run(&outer.build().unwrap()).unwrap(), Value::Int(5));
}

#[test]
fn test_unbound_local() {
    let mut b = CodeBuilder::new("f");
    let x = b.add_local("x");
    b.emit(Opcode::LoadFast, x);
    b.emit(Opcode::ReturnValue, 0);
    let mut vm = Vm::new();
    assert_eq!(
        uncaught_kind(vm.run(&b.build().unwrap())),
        ExceptionKind::UnboundLocalError
    );
}

#[test]
fn test_missing_global_is_name_error() {
    let mut b = CodeBuilder::new("f");
    let name = b.add_name("nowhere");
    b.emit(Opcode::LoadGlobal, name);
    b.emit(Opcode::ReturnValue, 0);
    let mut vm = Vm::new();
    assert_eq!(uncaught_kind(vm.run(&b.build().unwrap())), ExceptionKind::NameError);
}

#[test]
fn test_class_instantiation_runs_init() {
    fn init(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
        if let Some(Value::Instance(obj)) = args.first() {
            obj.set_attr("x", args.get(1).cloned().unwrap_or(Value::None));
        }
        Ok(Value::None)
    }
    let class = TypeObject::new("Point");
    class.set_class_attr("__init__", Value::Builtin(core_types::Builtin::new("__init__", init)));
    let mut vm = Vm::new();
    let obj = vm.call(&Value::Type(Rc::clone(&class)), vec![Value::Int(7)]).unwrap();
    match obj {
        Value::Instance(obj) => assert_eq!(obj.get_attr("x"), Some(Value::Int(7))),
        other => panic!("expected instance, got {:?}", other),
    }
}

// ============================================================================
// Specialization
// ============================================================================

#[test]
fn test_binary_op_specializes_after_warmup() {
    let mut vm = Vm::new();
    let code = add_code();
    let add = function(&vm, Arc::clone(&code));
    for _ in 0..7 {
        vm.call(&add, vec![Value::Int(1), Value::Int(2)]).unwrap();
    }
    assert_eq!(code.opcode_at(2), Some(Opcode::BinaryOp));
    vm.call(&add, vec![Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(code.opcode_at(2), Some(Opcode::BinaryOpAddInt));
    assert_eq!(vm.stats().specialization.successes, 1);
}

#[test]
fn test_guard_failure_deoptimizes_once() {
    let mut vm = Vm::new();
    let code = add_code();
    let add = function(&vm, Arc::clone(&code));
    for _ in 0..10 {
        vm.call(&add, vec![Value::Int(1), Value::Int(2)]).unwrap();
    }
    let joined = vm.call(&add, vec![Value::str("a"), Value::str("b")]).unwrap();
    assert_eq!(joined, Value::str("ab"));
    assert_eq!(code.opcode_at(2), Some(Opcode::BinaryOp));
    assert_eq!(vm.stats().specialization.deopts, 1);
    assert_eq!(code.cache(2).counter(), vm.config().adaptive_cooldown);
}

#[test]
fn test_no_specialization_config_leaves_code_alone() {
    let mut vm = Vm::with_config(EngineConfig::no_specialization());
    let code = add_code();
    let add = function(&vm, Arc::clone(&code));
    for _ in 0..50 {
        vm.call(&add, vec![Value::Int(1), Value::Int(2)]).unwrap();
    }
    assert_eq!(code.opcode_at(2), Some(Opcode::BinaryOp));
    assert_eq!(vm.stats().specialization.attempts, 0);
}

#[test]
fn test_float_compare_handles_nan_without_deopt() {
    let mut vm = Vm::new();
    let less = compare_code(ComparisonOperator::Less);
    let unequal = compare_code(ComparisonOperator::NotEqual);
    let (lt, ne) = (function(&vm, Arc::clone(&less)), function(&vm, Arc::clone(&unequal)));
    for _ in 0..8 {
        vm.call(&lt, vec![Value::Float(1.0), Value::Float(2.0)]).unwrap();
        vm.call(&ne, vec![Value::Float(1.0), Value::Float(1.0)]).unwrap();
    }
    assert_eq!(less.opcode_at(2), Some(Opcode::CompareOpFloat));
    assert_eq!(unequal.opcode_at(2), Some(Opcode::CompareOpFloat));

    let nan = Value::Float(f64::NAN);
    let cases = [
        (&lt, nan.clone(), Value::Float(1.0), false),
        (&lt, Value::Float(1.0), nan.clone(), false),
        (&lt, Value::Float(-0.0), Value::Float(0.0), false),
        (&lt, Value::Float(-1.5), Value::Float(0.0), true),
        (&ne, nan.clone(), nan.clone(), true),
        (&ne, Value::Float(-0.0), Value::Float(0.0), false),
    ];
    for (callee, a, b, expected) in cases {
        assert_eq!(vm.call(callee, vec![a, b]).unwrap(), Value::Bool(expected));
    }
    assert_eq!(less.opcode_at(2), Some(Opcode::CompareOpFloat));
    assert_eq!(unequal.opcode_at(2), Some(Opcode::CompareOpFloat));
    assert_eq!(vm.stats().specialization.deopts, 0);
}

#[test]
fn test_str_compare_specializes_and_stays() {
    let mut vm = Vm::new();
    let less = compare_code(ComparisonOperator::Less);
    let equal = compare_code(ComparisonOperator::Equal);
    let (lt, eq) = (function(&vm, Arc::clone(&less)), function(&vm, Arc::clone(&equal)));
    for _ in 0..8 {
        vm.call(&lt, vec![Value::str("a"), Value::str("b")]).unwrap();
        vm.call(&eq, vec![Value::str("a"), Value::str("a")]).unwrap();
    }
    assert_eq!(less.opcode_at(2), Some(Opcode::CompareOpStr));
    assert_eq!(equal.opcode_at(2), Some(Opcode::CompareOpStr));

    assert_eq!(vm.call(&lt, vec![Value::str("ab"), Value::str("b")]).unwrap(), Value::Bool(true));
    assert_eq!(vm.call(&lt, vec![Value::str("b"), Value::str("ab")]).unwrap(), Value::Bool(false));
    assert_eq!(vm.call(&lt, vec![Value::str("ab"), Value::str("ab")]).unwrap(), Value::Bool(false));
    assert_eq!(vm.call(&eq, vec![Value::str("ab"), Value::str("ab")]).unwrap(), Value::Bool(true));
    assert_eq!(vm.call(&eq, vec![Value::str("ab"), Value::str("abc")]).unwrap(), Value::Bool(false));
    assert_eq!(vm.stats().specialization.deopts, 0);

    // A mixed pair leaves the fast path.
    assert_eq!(vm.call(&eq, vec![Value::str("1"), Value::Int(1)]).unwrap(), Value::Bool(false));
    assert_eq!(equal.opcode_at(2), Some(Opcode::CompareOp));
    assert_eq!(vm.stats().specialization.deopts, 1);
}

#[test]
fn test_global_specialization_follows_keys_version() {
    let mut b = CodeBuilder::new("get_g");
    let g = b.add_name("g");
    b.emit(Opcode::LoadGlobal, g);
    b.emit(Opcode::ReturnValue, 0);
    let code = b.build().unwrap();

    let mut vm = Vm::new();
    vm.globals().insert("g", Value::Int(1));
    let get_g = function(&vm, Arc::clone(&code));
    for _ in 0..8 {
        vm.call(&get_g, vec![]).unwrap();
    }
    assert_eq!(code.opcode_at(0), Some(Opcode::LoadGlobalModule));

    // Rebinding an existing key keeps the entry index valid.
    vm.globals().insert("g", Value::Int(2));
    assert_eq!(vm.call(&get_g, vec![]).unwrap(), Value::Int(2));
    assert_eq!(code.opcode_at(0), Some(Opcode::LoadGlobalModule));

    // A new key moves the keys version and the guard fails.
    vm.globals().insert("h", Value::Int(0));
    assert_eq!(vm.call(&get_g, vec![]).unwrap(), Value::Int(2));
    assert_eq!(code.opcode_at(0), Some(Opcode::LoadGlobal));
}

#[test]
fn test_attribute_specialization_survives_until_class_changes() {
    let mut b = CodeBuilder::new("getx");
    b.arg_count(1);
    let p = b.add_local("p");
    let x = b.add_name("x");
    b.emit(Opcode::LoadFast, p);
    b.emit(Opcode::LoadAttr, x);
    b.emit(Opcode::ReturnValue, 0);
    let code = b.build().unwrap();

    let class = TypeObject::new("Point");
    let obj = Instance::new(&class);
    obj.set_attr("x", Value::Int(3));
    let obj = Value::Instance(obj);

    let mut vm = Vm::new();
    let getx = function(&vm, Arc::clone(&code));
    for _ in 0..8 {
        assert_eq!(vm.call(&getx, vec![obj.clone()]).unwrap(), Value::Int(3));
    }
    assert_eq!(code.opcode_at(1), Some(Opcode::LoadAttrInstanceValue));

    class.set_class_attr("y", Value::Int(0));
    assert_eq!(vm.call(&getx, vec![obj.clone()]).unwrap(), Value::Int(3));
    assert_eq!(code.opcode_at(1), Some(Opcode::LoadAttr));
    assert_eq!(vm.stats().specialization.deopts, 1);
}

#[test]
fn test_call_site_specializes_for_exact_args() {
    let mut vm = Vm::new();
    let add = function(&vm, add_code());
    vm.globals().insert("add", add);

    let mut b = CodeBuilder::new("caller");
    let name = b.add_name("add");
    let one = b.add_constant(Constant::Int(1));
    b.emit(Opcode::LoadGlobal, name);
    b.emit(Opcode::LoadConst, one);
    b.emit(Opcode::LoadConst, one);
    b.emit(Opcode::Call, 2);
    b.emit(Opcode::ReturnValue, 0);
    let code = b.build().unwrap();
    let caller = function(&vm, Arc::clone(&code));
    for _ in 0..8 {
        assert_eq!(vm.call(&caller, vec![]).unwrap(), Value::Int(2));
    }
    assert_eq!(code.opcode_at(3), Some(Opcode::CallPyExactArgs));
}

// ============================================================================
// Tier 2
// ============================================================================

#[test]
fn test_hot_loop_gets_executor() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    let code = sum_range_code();
    let f = function(&vm, Arc::clone(&code));
    assert_eq!(vm.call(&f, vec![Value::Int(200)]).unwrap(), Value::Int(19900));
    let stats = vm.stats();
    assert_eq!(code.executor_count(), 1);
    assert_eq!(stats.tier2.executors_installed, 1);
    assert!(stats.tier2.executor_entries >= 1);
    // The loop leaves through the exhausted-iterator guard.
    assert!(stats.tier2.side_exits >= 1);
    assert_eq!(stats.optimizer.traces, 1);
}

#[test]
fn test_executor_reused_across_calls() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    let f = function(&vm, sum_range_code());
    vm.call(&f, vec![Value::Int(50)]).unwrap();
    let entries = vm.stats().tier2.executor_entries;
    assert_eq!(vm.call(&f, vec![Value::Int(50)]).unwrap(), Value::Int(1225));
    assert!(vm.stats().tier2.executor_entries > entries);
    assert_eq!(vm.stats().tier2.executors_installed, 1);
}

#[test]
fn test_unfused_float_and_str_uops_stay_in_trace() {
    let floats = Value::list((0..100).map(|i| Value::Float(i as f64 * 0.5)).collect());
    let words = Value::list(["d", "a", "c", "b"].iter().cycle().take(60).map(|w| Value::str(w)).collect());
    let inputs = [(floats, Value::Float(0.0)), (words, Value::str(""))];

    let mut reference = Vm::with_config(EngineConfig::no_specialization());
    let fold_ref = function(&reference, fold_code());
    for (items, seed) in inputs {
        let expected = reference.call(&fold_ref, vec![items.clone(), seed.clone()]).unwrap();

        let mut vm = Vm::with_config(EngineConfig::eager());
        vm.set_optimizer_passes(OptimizerPasses {
            eliminate_guards: false,
            fold_constants: false,
            fuse: false,
        });
        let fold = function(&vm, fold_code());
        assert_eq!(vm.call(&fold, vec![items, seed]).unwrap(), expected);
        let stats = vm.stats().tier2;
        assert_eq!(stats.executors_installed, 1);
        // Only the exhausted iterator leaves the trace.
        assert!(stats.side_exits <= 2, "side exits: {}", stats.side_exits);
        assert_eq!(vm.stats().optimizer.fused, 0);
    }
}

#[test]
fn test_tier2_disabled_never_records() {
    let config = EngineConfig::eager().with_tier2(false);
    let mut vm = Vm::with_config(config);
    let code = sum_range_code();
    let f = function(&vm, Arc::clone(&code));
    vm.call(&f, vec![Value::Int(100)]).unwrap();
    assert_eq!(vm.stats().tier2.traces_started, 0);
    assert_eq!(code.executor_count(), 0);
}

#[test]
fn test_generator_loop_abandons_recording() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    let squares = function(&vm, squares_code());
    let gen = vm.call(&squares, vec![Value::Int(5)]).unwrap();
    let sum = vm.builtins().get("sum").unwrap();
    assert_eq!(vm.call(&sum, vec![gen]).unwrap(), Value::Int(30));
    // Every recording in the generator ends at a yield.
    assert_eq!(vm.stats().tier2.executors_installed, 0);
}

// ============================================================================
// Eval breaker
// ============================================================================

#[test]
fn test_interrupt_raises_keyboard_interrupt() {
    let mut vm = Vm::new();
    let f = function(&vm, sum_range_code());
    vm.eval_breaker().request_interrupt();
    assert_eq!(
        uncaught_kind(vm.call(&f, vec![Value::Int(10)])),
        ExceptionKind::KeyboardInterrupt
    );
    // The flag is consumed.
    assert_eq!(vm.call(&f, vec![Value::Int(10)]).unwrap(), Value::Int(45));
}

#[test]
fn test_pending_call_runs_at_backward_jump() {
    let mut vm = Vm::new();
    let f = function(&vm, sum_range_code());
    vm.eval_breaker().add_pending_call(|vm: &mut Vm| {
        vm.globals().insert("flag", Value::Int(1));
        Ok(())
    });
    assert!(!vm.globals().contains("flag"));
    vm.call(&f, vec![Value::Int(3)]).unwrap();
    assert_eq!(vm.globals().get("flag"), Some(Value::Int(1)));
}

#[test]
fn test_periodic_tick_checks_breaker() {
    let mut vm = Vm::with_config(EngineConfig::default().with_tick_interval(2));
    vm.eval_breaker().request_interrupt();
    let mut vm_code = CodeBuilder::new("<module>");
    let one = vm_code.add_constant(Constant::Int(1));
    vm_code.emit(Opcode::LoadConst, one);
    vm_code.emit(Opcode::LoadConst, one);
    vm_code.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    vm_code.emit(Opcode::ReturnValue, 0);
    assert_eq!(
        uncaught_kind(vm.run(&vm_code.build().unwrap())),
        ExceptionKind::KeyboardInterrupt
    );
}
