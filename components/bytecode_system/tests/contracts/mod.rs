//! Contract tests for bytecode_system
//!
//! Pins the public surface other components build on.

use std::sync::Arc;

use bytecode_system::{
    pack_pair, unpack_pair, CodeBuilder, CodeUnit, Constant, Executor, Opcode, UopId,
    UopInstruction, UopKind, VersionTag,
};

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_contract_shared_types_are_thread_safe() {
    assert_send_sync::<CodeUnit>();
    assert_send_sync::<Executor>();
    assert_send_sync::<VersionTag>();
}

#[test]
fn test_contract_opcode_bytes_are_stable() {
    assert_eq!(Opcode::Nop as u8, 0);
    assert_eq!(Opcode::LoadConst as u8, 4);
    assert_eq!(Opcode::ReturnValue as u8, 6);
    assert_eq!(Opcode::JumpBackward as u8, 27);
    assert_eq!(Opcode::ExtendedArg as u8, 36);
    assert_eq!(Opcode::EnterExecutor as u8, 38);
    assert_eq!(Opcode::BinaryOpAddInt as u8, 64);
}

#[test]
fn test_contract_every_uop_has_a_kind_and_name() {
    for id in UopId::ALL {
        assert!(id.name().starts_with('_'));
        if id.kind() == UopKind::Fused {
            assert!(id.name().contains("__"), "{}", id);
        }
    }
}

#[test]
fn test_contract_version_zero_never_validates() {
    let tag = VersionTag::new();
    assert_ne!(tag.get(), 0);
    assert!(!tag.matches(0));
    let old = tag.get();
    let new = tag.bump();
    assert_ne!(old, new);
    assert!(!tag.matches(old));
}

#[test]
fn test_contract_executor_table_round_trip() {
    let mut b = CodeBuilder::new("spin");
    let top = b.new_label();
    b.bind(top);
    b.emit(Opcode::Nop, 0);
    b.emit_jump(Opcode::JumpBackward, top);
    let code = b.build().unwrap();

    let tag = Arc::new(VersionTag::new());
    let uops = vec![
        UopInstruction::new(UopId::CheckValidity, 0, 0),
        UopInstruction::new(UopId::JumpToTop, 0, 0),
    ];
    let executor = Arc::new(Executor::new(
        uops,
        vec![Constant::Int(1)],
        vec![(Arc::clone(&tag), tag.get())],
        1,
        0,
    ));
    let index = code.install_executor(1, Arc::clone(&executor)).unwrap();
    assert!(Arc::ptr_eq(&code.executor_at(1).unwrap(), &executor));
    assert_eq!(code.cache(1).index(), index);
    assert!(code.disassemble().contains("ENTER_EXECUTOR"));

    tag.bump();
    assert!(!executor.is_valid());
    assert!(code.detach_executor(1).is_some());
    assert_eq!(code.opcode_at(1), Some(Opcode::JumpBackward));
}

#[test]
fn test_contract_pair_packing() {
    let packed = pack_pair(1, 2).unwrap();
    assert_eq!(unpack_pair(packed), (1, 2));
}
