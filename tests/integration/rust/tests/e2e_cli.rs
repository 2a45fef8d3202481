//! End-to-end tests through the command-line runtime
//!
//! Programs are serialized to bundle files exactly as a compiler would
//! emit them and run through `vm_cli`.

use std::io::Write;

use bytecode_system::{BinaryOperator, CodeBuilder, CodeBundle, Constant, Opcode};
use core_types::Value;
use interpreter::EngineConfig;
use tempfile::NamedTempFile;
use vm_cli::{CliError, Cli, Command, Runtime};

use clap::Parser as _;

/// Module defining `scale` as a nested function and calling it in a loop
fn module_bundle() -> CodeBundle {
    let mut inner = CodeBuilder::new("scale");
    inner.arg_count(1);
    let x = inner.add_local("x");
    let three = inner.add_constant(Constant::Int(3));
    inner.emit(Opcode::LoadFast, x);
    inner.emit(Opcode::LoadConst, three);
    inner.emit(Opcode::BinaryOp, BinaryOperator::Multiply as u32);
    inner.emit(Opcode::ReturnValue, 0);
    let inner = inner.build().unwrap();

    let mut b = CodeBuilder::new("<module>");
    let body = b.add_constant(Constant::Code(inner));
    let zero = b.add_constant(Constant::Int(0));
    let limit = b.add_constant(Constant::Int(200));
    let scale = b.add_name("scale");
    let range = b.add_name("range");
    let total = b.add_local("total");
    let i = b.add_local("i");
    let (top, end) = (b.new_label(), b.new_label());
    b.emit(Opcode::LoadConst, body);
    b.emit(Opcode::MakeFunction, 0);
    b.emit(Opcode::StoreGlobal, scale);
    b.emit(Opcode::LoadConst, zero);
    b.emit(Opcode::StoreFast, total);
    b.emit(Opcode::LoadGlobal, range);
    b.emit(Opcode::LoadConst, limit);
    b.emit(Opcode::Call, 1);
    b.emit(Opcode::GetIter, 0);
    b.bind(top);
    b.emit_jump(Opcode::ForIter, end);
    b.emit(Opcode::StoreFast, i);
    b.emit(Opcode::LoadFast, total);
    b.emit(Opcode::LoadGlobal, scale);
    b.emit(Opcode::LoadFast, i);
    b.emit(Opcode::Call, 1);
    b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
    b.emit(Opcode::StoreFast, total);
    b.emit_jump(Opcode::JumpBackward, top);
    b.bind(end);
    b.emit(Opcode::LoadFast, total);
    b.emit(Opcode::ReturnValue, 0);
    b.to_bundle().unwrap()
}

fn bundle_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let json = module_bundle().to_json().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

/// Test: a module with nested code runs identically on every preset
#[test]
fn test_module_runs_on_every_preset() {
    let file = bundle_file();
    for config in [
        EngineConfig::no_specialization(),
        EngineConfig::default(),
        EngineConfig::eager(),
    ] {
        let mut runtime = Runtime::new(config);
        let result = runtime.execute_file(file.path()).unwrap();
        assert_eq!(result, Value::Int(3 * 19_900));
    }
}

/// Test: command-line flags flow into the engine
#[test]
fn test_flags_reach_engine() {
    let file = bundle_file();
    let path = file.path().to_str().unwrap();
    let cli = Cli::try_parse_from([
        "tiervm",
        "run",
        path,
        "--warmup",
        "1",
        "--jump-threshold",
        "1",
        "--no-specialize",
    ])
    .unwrap();
    let Command::Run(args) = cli.command else {
        panic!("expected run");
    };
    let mut runtime = Runtime::from_args(&args).unwrap();
    assert_eq!(runtime.execute_file(&args.file).unwrap(), Value::Int(59_700));
    let stats = runtime.stats();
    assert_eq!(stats.specialization.attempts, 0);
    assert_eq!(stats.tier2.executors_installed, 1);
}

/// Test: the bundle survives a JSON round trip before execution
#[test]
fn test_bundle_json_round_trip_executes() {
    let bundle = module_bundle();
    let text = bundle.to_json().unwrap();
    assert_eq!(CodeBundle::from_json(&text).unwrap(), bundle);
    let mut runtime = Runtime::new(EngineConfig::default());
    assert_eq!(runtime.execute_json(&text).unwrap(), Value::Int(59_700));
}

/// Test: a corrupted bundle is reported, not executed
#[test]
fn test_corrupted_bundle() {
    let mut bundle = module_bundle();
    bundle.code.truncate(bundle.code.len() - 2);
    let mut runtime = Runtime::new(EngineConfig::default());
    let err = runtime.execute_json(&bundle.to_json().unwrap()).unwrap_err();
    assert!(matches!(err, CliError::Bundle(_)));
}
