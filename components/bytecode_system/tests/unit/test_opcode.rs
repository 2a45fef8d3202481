//! Tests for the opcode table

use bytecode_system::{BinaryOperator, ComparisonOperator, Opcode};

#[test]
fn test_every_opcode_round_trips_through_its_byte() {
    for op in Opcode::ALL {
        assert_eq!(Opcode::from_u8(*op as u8), Some(*op));
    }
    assert_eq!(Opcode::from_u8(200), None);
}

#[test]
fn test_specialized_forms_map_to_one_base() {
    for op in Opcode::ALL.iter().filter(|op| op.is_specialized()) {
        let base = op.base();
        assert!(!base.is_specialized(), "{} maps to {}", op, base);
        assert!(base.is_adaptive(), "{} has non-adaptive base {}", op, base);
    }
    assert_eq!(Opcode::EnterExecutor.base(), Opcode::JumpBackward);
}

#[test]
fn test_specialized_forms_keep_the_stack_effect() {
    for op in Opcode::ALL.iter().filter(|op| op.is_specialized()) {
        for oparg in 0..3 {
            assert_eq!(op.stack_effect(oparg, false), op.base().stack_effect(oparg, false));
            assert_eq!(op.stack_effect(oparg, true), op.base().stack_effect(oparg, true));
        }
    }
}

#[test]
fn test_compiler_output_excludes_engine_forms() {
    assert!(Opcode::BinaryOp.is_compiler_output());
    assert!(!Opcode::BinaryOpAddInt.is_compiler_output());
    assert!(!Opcode::EnterExecutor.is_compiler_output());
}

#[test]
fn test_jump_targets() {
    assert_eq!(Opcode::JumpForward.jump_target(5, 3), Some(8));
    assert_eq!(Opcode::ForIterRange.jump_target(5, 2), Some(7));
    assert_eq!(Opcode::JumpBackward.jump_target(5, 4), Some(1));
    assert_eq!(Opcode::JumpBackward.jump_target(2, 4), None);
    assert_eq!(Opcode::LoadFast.jump_target(2, 4), None);
}

#[test]
fn test_for_iter_effect_depends_on_branch() {
    assert_eq!(Opcode::ForIter.stack_effect(0, false), 1);
    assert_eq!(Opcode::ForIter.stack_effect(0, true), -1);
}

#[test]
fn test_operator_operands() {
    assert_eq!(BinaryOperator::from_oparg(0), Some(BinaryOperator::Add));
    assert_eq!(BinaryOperator::Add.symbol(), "+");
    assert_eq!(BinaryOperator::from_oparg(99), None);
    let le = ComparisonOperator::from_oparg(1).unwrap();
    assert_eq!(le, ComparisonOperator::LessEqual);
    assert!(le.matches(std::cmp::Ordering::Equal));
    assert!(!le.matches(std::cmp::Ordering::Greater));
}
