//! Tests for code units, caches and rewriting

use std::sync::Arc;
use std::thread;

use bytecode_system::{CodeBuilder, CodeUnit, Constant, ExceptionEntry, Opcode};

fn adder() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("add");
    b.arg_count(2);
    let a = b.add_local("a");
    let c = b.add_local("b");
    b.set_line(1);
    b.emit(Opcode::LoadFast, a);
    b.emit(Opcode::LoadFast, c);
    b.emit(Opcode::BinaryOp, 0);
    b.emit(Opcode::ReturnValue, 0);
    b.build().unwrap()
}

#[test]
fn test_quicken_primes_adaptive_counters() {
    let code = adder();
    assert!(!code.is_quickened());
    code.quicken(8, 16);
    assert!(code.is_quickened());
    assert_eq!(code.cache(2).counter(), 8);
    assert_eq!(code.cache(0).counter(), 0);
}

#[test]
fn test_rewrite_keeps_operand_and_length() {
    let code = adder();
    let before = code.len();
    assert!(code.rewrite(2, Opcode::BinaryOp, Opcode::BinaryOpAddInt));
    assert_eq!(code.opcode_at(2), Some(Opcode::BinaryOpAddInt));
    assert_eq!(code.instruction(2).unwrap().oparg, 0);
    assert_eq!(code.len(), before);
    // Stale expectation fails
    assert!(!code.rewrite(2, Opcode::BinaryOp, Opcode::BinaryOpAddFloat));
    assert!(code.rewrite(2, Opcode::BinaryOpAddInt, Opcode::BinaryOp));
    assert_eq!(code.rewrite_count(), 2);
}

#[test]
fn test_concurrent_rewrites_only_one_wins() {
    let code = adder();
    let handles: Vec<_> = [Opcode::BinaryOpAddInt, Opcode::BinaryOpAddFloat]
        .into_iter()
        .map(|target| {
            let code = Arc::clone(&code);
            thread::spawn(move || code.rewrite(2, Opcode::BinaryOp, target))
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
    assert!(code.opcode_at(2).unwrap().is_specialized());
}

#[test]
fn test_stack_depths_are_exposed() {
    let code = adder();
    assert_eq!(code.stack_depth_at(0), Some(0));
    assert_eq!(code.stack_depth_at(2), Some(2));
    assert_eq!(code.stack_depth_at(3), Some(1));
    assert_eq!(code.stack_size(), 2);
}

#[test]
fn test_innermost_handler_wins() {
    let mut b = CodeBuilder::new("nested");
    let none = b.add_constant(Constant::None);
    let outer_start = b.new_label();
    let inner_start = b.new_label();
    let inner_end = b.new_label();
    let outer_end = b.new_label();
    let inner_handler = b.new_label();
    let outer_handler = b.new_label();
    b.bind(outer_start);
    b.emit(Opcode::Nop, 0);
    b.bind(inner_start);
    b.emit(Opcode::Nop, 0);
    b.bind(inner_end);
    b.emit(Opcode::Nop, 0);
    b.bind(outer_end);
    b.emit(Opcode::ReturnConst, none);
    b.bind(inner_handler);
    b.emit(Opcode::Reraise, 0);
    b.bind(outer_handler);
    b.emit(Opcode::Reraise, 0);
    b.add_handler(outer_start, outer_end, outer_handler, 0, false);
    b.add_handler(inner_start, inner_end, inner_handler, 0, false);
    let code = b.build().unwrap();

    assert_eq!(code.handler_for(0).map(|e| e.target), Some(5));
    assert_eq!(code.handler_for(1).map(|e| e.target), Some(4));
    assert_eq!(code.handler_for(3), None);
    assert_eq!(
        code.exception_table()[1],
        ExceptionEntry {
            start: 1,
            end: 2,
            target: 4,
            depth: 0,
            lasti: false
        }
    );
}

#[test]
fn test_nested_code_constant() {
    let inner = adder();
    let mut b = CodeBuilder::new("<module>");
    let k = b.add_constant(Constant::Code(Arc::clone(&inner)));
    b.emit(Opcode::LoadConst, k);
    b.emit(Opcode::MakeFunction, 0);
    b.emit(Opcode::ReturnValue, 0);
    let module = b.build().unwrap();
    match &module.constants()[0] {
        Constant::Code(code) => assert_eq!(code.name().as_ref(), "add"),
        other => panic!("expected code constant, got {}", other),
    }
    assert!(module.disassemble().contains("Disassembly of <code add>:"));
}
