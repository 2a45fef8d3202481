//! Integration test suite for the tiered engine
//!
//! This crate provides cross-component tests: programs built with the
//! bytecode builder are run on every tier and the observable behavior is
//! compared.

use std::rc::Rc;
use std::sync::Arc;

use bytecode_system::{BinaryOperator, CodeBuilder, CodeUnit, Constant, Opcode};
use core_types::{Function, Value};
use interpreter::{EngineConfig, Vm};

/// Re-export components for test convenience
pub mod components {
    pub use bytecode_system;
    pub use core_types;
    pub use interpreter;
    pub use trace_optimizer;
    pub use vm_cli;
}

/// The three standard tier configurations: generic, default and eager
pub fn configs() -> [(&'static str, EngineConfig); 3] {
    [
        ("generic", EngineConfig::no_specialization()),
        ("default", EngineConfig::default()),
        ("eager", EngineConfig::eager()),
    ]
}

/// Wrap a code unit in a function bound to `vm`'s namespaces
pub fn function(vm: &Vm, code: Arc<CodeUnit>) -> Value {
    Value::Function(Function::new(
        code,
        Rc::clone(vm.globals()),
        Rc::clone(vm.builtins()),
        Vec::new(),
    ))
}

/// Bytecode for the test programs
pub mod programs {
    use super::*;

    /// `def add(a, b): x = a + b; return x`
    pub fn add() -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("add");
        b.arg_count(2);
        let a = b.add_local("a");
        let c = b.add_local("b");
        let x = b.add_local("x");
        b.emit(Opcode::LoadFast, a);
        b.emit(Opcode::LoadFast, c);
        b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
        b.emit(Opcode::StoreFast, x);
        b.emit(Opcode::LoadFast, x);
        b.emit(Opcode::ReturnValue, 0);
        build(&b)
    }

    /// Index of the `BINARY_OP` in [`add`]
    pub const ADD_SITE: usize = 2;

    /// `def halve(a): return a // 2`, a site with no specialized form
    pub fn halve() -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("halve");
        b.arg_count(1);
        let a = b.add_local("a");
        let two = b.add_constant(Constant::Int(2));
        b.emit(Opcode::LoadFast, a);
        b.emit(Opcode::LoadConst, two);
        b.emit(Opcode::BinaryOp, BinaryOperator::FloorDivide as u32);
        b.emit(Opcode::ReturnValue, 0);
        build(&b)
    }

    /// Index of the `BINARY_OP` in [`halve`]
    pub const HALVE_SITE: usize = 2;

    /// `def total(items): t = 0; for x in items: t = t + x; return t`
    pub fn total() -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("total");
        b.arg_count(1);
        let items = b.add_local("items");
        let t = b.add_local("t");
        let x = b.add_local("x");
        let zero = b.add_constant(Constant::Int(0));
        let (top, end) = (b.new_label(), b.new_label());
        b.emit(Opcode::LoadConst, zero);
        b.emit(Opcode::StoreFast, t);
        b.emit(Opcode::LoadFast, items);
        b.emit(Opcode::GetIter, 0);
        b.bind(top);
        b.emit_jump(Opcode::ForIter, end);
        b.emit(Opcode::StoreFast, x);
        b.emit(Opcode::LoadFast, t);
        b.emit(Opcode::LoadFast, x);
        b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
        b.emit(Opcode::StoreFast, t);
        b.emit_jump(Opcode::JumpBackward, top);
        b.bind(end);
        b.emit(Opcode::LoadFast, t);
        b.emit(Opcode::ReturnValue, 0);
        build(&b)
    }

    /// `def scaled(n): t = 0; for i in range(n): t = t + i * K; return t`
    ///
    /// `K` is a global.
    pub fn scaled() -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("scaled");
        b.arg_count(1);
        let n = b.add_local("n");
        let t = b.add_local("t");
        let i = b.add_local("i");
        let zero = b.add_constant(Constant::Int(0));
        let range = b.add_name("range");
        let k = b.add_name("K");
        let (top, end) = (b.new_label(), b.new_label());
        b.emit(Opcode::LoadConst, zero);
        b.emit(Opcode::StoreFast, t);
        b.emit(Opcode::LoadGlobal, range);
        b.emit(Opcode::LoadFast, n);
        b.emit(Opcode::Call, 1);
        b.emit(Opcode::GetIter, 0);
        b.bind(top);
        b.emit_jump(Opcode::ForIter, end);
        b.emit(Opcode::StoreFast, i);
        b.emit(Opcode::LoadFast, t);
        b.emit(Opcode::LoadFast, i);
        b.emit(Opcode::LoadGlobal, k);
        b.emit(Opcode::BinaryOp, BinaryOperator::Multiply as u32);
        b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
        b.emit(Opcode::StoreFast, t);
        b.emit_jump(Opcode::JumpBackward, top);
        b.bind(end);
        b.emit(Opcode::LoadFast, t);
        b.emit(Opcode::ReturnValue, 0);
        build(&b)
    }

    /// ```text
    /// def make_points(n):
    ///     t = 0
    ///     for i in range(n):
    ///         p = Point()
    ///         p.x = i
    ///         t = t + p.x
    ///     return t
    /// ```
    pub fn make_points() -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("make_points");
        b.arg_count(1);
        let n = b.add_local("n");
        let t = b.add_local("t");
        let i = b.add_local("i");
        let p = b.add_local("p");
        let zero = b.add_constant(Constant::Int(0));
        let none = b.add_constant(Constant::None);
        let range = b.add_name("range");
        let point = b.add_name("Point");
        let x = b.add_name("x");
        let (top, end) = (b.new_label(), b.new_label());
        b.emit(Opcode::LoadConst, zero);
        b.emit(Opcode::StoreFast, t);
        b.emit(Opcode::LoadGlobal, range);
        b.emit(Opcode::LoadFast, n);
        b.emit(Opcode::Call, 1);
        b.emit(Opcode::GetIter, 0);
        b.bind(top);
        b.emit_jump(Opcode::ForIter, end);
        b.emit(Opcode::StoreFast, i);
        b.emit(Opcode::LoadGlobal, point);
        b.emit(Opcode::Call, 0);
        b.emit(Opcode::StoreFast, p);
        b.emit(Opcode::LoadFast, i);
        b.emit(Opcode::LoadFast, p);
        b.emit(Opcode::StoreAttr, x);
        b.emit(Opcode::LoadFast, t);
        b.emit(Opcode::LoadFast, p);
        b.emit(Opcode::LoadAttr, x);
        b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
        b.emit(Opcode::StoreFast, t);
        b.emit_jump(Opcode::JumpBackward, top);
        b.bind(end);
        // Drop the last point before returning.
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::StoreFast, p);
        b.emit(Opcode::LoadFast, t);
        b.emit(Opcode::ReturnValue, 0);
        build(&b)
    }

    fn build(builder: &CodeBuilder) -> Arc<CodeUnit> {
        match builder.build() {
            Ok(code) => code,
            Err(err) => panic!("test program is malformed: {}", err),
        }
    }
}
