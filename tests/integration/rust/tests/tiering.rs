//! Tiering Integration Tests
//!
//! Verifies that quickening, deoptimization and tier-2 executors never
//! change what a program computes, and that their bookkeeping behaves.

use std::sync::Arc;

use core_types::{Builtin, Interp, Unwind, Value};
use integration_tests::{configs, function, programs};
use interpreter::monitoring::COVERAGE_ID;
use interpreter::{EngineConfig, Event, EventSet, Vm};

use bytecode_system::Opcode;

fn ints(values: impl IntoIterator<Item = i64>) -> Value {
    Value::list(values.into_iter().map(Value::Int).collect())
}

fn record(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    let rendered: Vec<String> = args.iter().skip(1).map(|v| v.repr()).collect();
    interp.write_output(&format!("{}\n", rendered.join(" ")));
    Ok(Value::None)
}

// ============================================================================
// Transparency
// ============================================================================

/// Test: every tier computes the same results over mixed inputs
#[test]
fn test_results_identical_across_tiers() {
    let inputs = vec![
        vec![Value::Int(1), Value::Int(2)],
        vec![Value::Int(i64::MAX), Value::Int(1)],
        vec![Value::Float(1.5), Value::Float(2.25)],
        vec![Value::str("ab"), Value::str("cd")],
        vec![Value::Int(3), Value::Float(0.5)],
        vec![Value::list(vec![Value::Int(1)]), Value::list(vec![Value::Int(2)])],
    ];
    let mut outputs: Vec<Vec<Value>> = Vec::new();
    for (_, config) in configs() {
        let mut vm = Vm::with_config(config);
        let add = function(&vm, programs::add());
        let mut results = Vec::new();
        // Long runs of one type interleaved with switches.
        for args in &inputs {
            for _ in 0..20 {
                results.push(vm.call(&add, args.clone()).unwrap());
            }
        }
        outputs.push(results);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);
}

/// Test: a monitoring tool sees the same events whatever tier ran before
#[test]
fn test_event_streams_identical_across_tiers() {
    let mut streams = Vec::new();
    for (_, config) in configs() {
        let mut vm = Vm::with_config(config);
        vm.capture_output();
        vm.globals().insert("K", Value::Int(3));
        let scaled = function(&vm, programs::scaled());
        for _ in 0..10 {
            vm.call(&scaled, vec![Value::Int(30)]).unwrap();
        }
        let monitoring = vm.monitoring_mut();
        monitoring.use_tool_id(COVERAGE_ID, "recorder").unwrap();
        let callback = Value::Builtin(Builtin::new("record", record));
        for event in [Event::Jump, Event::Branch, Event::PyStart, Event::PyReturn] {
            monitoring
                .register_callback(COVERAGE_ID, event, Some(callback.clone()))
                .unwrap();
        }
        monitoring
            .set_events(
                COVERAGE_ID,
                EventSet::of(&[Event::Jump, Event::Branch, Event::PyStart, Event::PyReturn]),
            )
            .unwrap();
        assert_eq!(vm.call(&scaled, vec![Value::Int(5)]).unwrap(), Value::Int(30));
        streams.push(vm.take_output());
    }
    assert!(!streams[0].is_empty());
    assert_eq!(streams[0], streams[1]);
    assert_eq!(streams[0], streams[2]);
}

// ============================================================================
// Specialization lifecycle
// ============================================================================

/// Test: `x = a + b` specializes on the 8th call and deopts once on a str
#[test]
fn test_add_site_lifecycle() {
    let mut vm = Vm::new();
    let code = programs::add();
    let add = function(&vm, Arc::clone(&code));
    for call in 1..=1000 {
        assert_eq!(
            vm.call(&add, vec![Value::Int(call), Value::Int(1)]).unwrap(),
            Value::Int(call + 1)
        );
        if call == 7 {
            assert_eq!(code.opcode_at(programs::ADD_SITE), Some(Opcode::BinaryOp));
        }
        if call == 8 {
            assert_eq!(code.opcode_at(programs::ADD_SITE), Some(Opcode::BinaryOpAddInt));
        }
    }
    let joined = vm.call(&add, vec![Value::str("x"), Value::str("y")]).unwrap();
    assert_eq!(joined, Value::str("xy"));
    let stats = vm.stats().specialization;
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.deopts, 1);
    assert_eq!(code.opcode_at(programs::ADD_SITE), Some(Opcode::BinaryOp));
}

/// Test: after a deopt the site re-specializes for the new type
#[test]
fn test_respecializes_after_cooldown() {
    let mut vm = Vm::new();
    let code = programs::add();
    let add = function(&vm, Arc::clone(&code));
    for _ in 0..8 {
        vm.call(&add, vec![Value::Int(1), Value::Int(1)]).unwrap();
    }
    let cooldown = vm.config().adaptive_cooldown as usize;
    for _ in 0..=cooldown {
        vm.call(&add, vec![Value::Float(1.0), Value::Float(1.0)]).unwrap();
    }
    assert_eq!(code.opcode_at(programs::ADD_SITE), Some(Opcode::BinaryOpAddFloat));
    assert_eq!(vm.stats().specialization.deopts, 1);
}

/// Test: a site with no specialized form backs off and is then left alone
#[test]
fn test_backoff_reaches_disabled_and_stays() {
    let mut vm = Vm::new();
    let code = programs::halve();
    let halve = function(&vm, Arc::clone(&code));
    for n in 0..131 {
        vm.call(&halve, vec![Value::Int(n)]).unwrap();
    }
    // Attempts at calls 8, 12, 20, 36 and 68 under doubling backoff.
    assert_eq!(vm.stats().specialization.attempts, 5);
    assert!(!code.cache(programs::HALVE_SITE).is_disabled());

    vm.call(&halve, vec![Value::Int(0)]).unwrap();
    assert!(code.cache(programs::HALVE_SITE).is_disabled());
    let settled = vm.stats().specialization;
    assert_eq!(settled.attempts, 6);
    assert_eq!(settled.disabled, 1);

    for n in 0..500 {
        assert_eq!(vm.call(&halve, vec![Value::Int(2 * n)]).unwrap(), Value::Int(n));
    }
    assert_eq!(vm.stats().specialization, settled);
}

// ============================================================================
// Tier 2
// ============================================================================

/// Test: a type change in the middle of a traced loop leaves through a side exit
#[test]
fn test_type_change_mid_trace() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    let total = function(&vm, programs::total());
    let mut items: Vec<Value> = (0..50).map(Value::Int).collect();
    items.push(Value::Float(0.5));
    items.extend((50..60).map(Value::Int));
    let result = vm.call(&total, vec![Value::list(items)]).unwrap();
    assert_eq!(result, Value::Float((0..60).sum::<i64>() as f64 + 0.5));
    let stats = vm.stats().tier2;
    assert_eq!(stats.executors_installed, 1);
    assert!(stats.side_exits >= 2);
}

/// Test: an executor whose globals dependency changed is dropped lazily
#[test]
fn test_executor_invalidated_by_new_global() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    vm.globals().insert("K", Value::Int(2));
    let code = programs::scaled();
    let scaled = function(&vm, Arc::clone(&code));
    assert_eq!(vm.call(&scaled, vec![Value::Int(10)]).unwrap(), Value::Int(90));
    assert_eq!(code.executor_count(), 1);

    // A new key invalidates; nothing happens until the loop is entered again.
    vm.globals().insert("unrelated", Value::None);
    assert_eq!(vm.stats().tier2.invalidations, 0);

    vm.globals().insert("K", Value::Int(3));
    assert_eq!(vm.call(&scaled, vec![Value::Int(10)]).unwrap(), Value::Int(135));
    assert!(vm.stats().tier2.invalidations >= 1);
}

/// Test: rebinding a global read inside a trace is seen immediately
#[test]
fn test_rebound_global_visible_in_trace() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    vm.globals().insert("K", Value::Int(1));
    let scaled = function(&vm, programs::scaled());
    assert_eq!(vm.call(&scaled, vec![Value::Int(10)]).unwrap(), Value::Int(45));
    vm.globals().insert("K", Value::Int(10));
    assert_eq!(vm.call(&scaled, vec![Value::Int(10)]).unwrap(), Value::Int(450));
}

/// Test: plain iteration over list inputs agrees across tiers
#[test]
fn test_list_iteration_across_tiers() {
    for (name, config) in configs() {
        let mut vm = Vm::with_config(config);
        let total = function(&vm, programs::total());
        for n in [0, 1, 5, 100] {
            let expected = Value::Int((0..n).sum());
            assert_eq!(
                vm.call(&total, vec![ints(0..n)]).unwrap(),
                expected,
                "config {}",
                name
            );
        }
    }
}
