//! Threading Integration Tests
//!
//! Interpreters on different threads share code units under one
//! interpreter lock; cross-thread requests go through the eval breaker.

use std::sync::{mpsc, Arc};
use std::thread;

use bytecode_system::CodeUnit;
use core_types::{ExceptionKind, Value};
use integration_tests::{function, programs};
use interpreter::{EngineConfig, EngineError, InterpreterLock, Vm};

fn run_scaled(code: Arc<CodeUnit>, lock: Arc<InterpreterLock>, n: i64) -> Value {
    let config = EngineConfig::default().with_tick_interval(50);
    let mut vm = Vm::with_config(config);
    vm.set_interpreter_lock(lock);
    vm.globals().insert("K", Value::Int(1));
    let scaled = function(&vm, code);
    let mut last = Value::None;
    for _ in 0..20 {
        last = vm.call(&scaled, vec![Value::Int(n)]).unwrap();
    }
    last
}

/// Test: two interpreters sharing code and the lock both finish correctly
#[test]
fn test_two_threads_share_code_under_lock() {
    let code = programs::scaled();
    let lock = InterpreterLock::new();

    let handles: Vec<_> = [2_000, 3_000]
        .into_iter()
        .map(|n| {
            let code = Arc::clone(&code);
            let lock = Arc::clone(&lock);
            thread::spawn(move || match run_scaled(code, lock, n) {
                Value::Int(v) => v,
                other => panic!("unexpected result {:?}", other),
            })
        })
        .collect();
    let results: Vec<i64> = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(results, vec![1_999_000, 4_498_500]);
    // Forty top-level calls, plus handoffs.
    assert!(lock.acquisitions() >= 40);
    assert!(!lock.is_held_by_current_thread());
    assert_eq!(lock.waiters(), 0);
}

/// Test: an interrupt requested from another thread stops a long loop
#[test]
fn test_cross_thread_interrupt() {
    let (sender, receiver) = mpsc::channel();
    let worker = thread::spawn(move || {
        let mut vm = Vm::with_config(EngineConfig::default().with_tick_interval(10));
        sender.send(vm.eval_breaker()).unwrap();
        vm.globals().insert("K", Value::Int(1));
        let scaled = function(&vm, programs::scaled());
        // Long enough that the interrupt lands first.
        match vm.call(&scaled, vec![Value::Int(i64::MAX / 4)]) {
            Err(EngineError::Uncaught(exc)) => exc.kind(),
            other => panic!("expected interrupt, got {:?}", other),
        }
    });
    let breaker = receiver.recv().unwrap();
    breaker.request_interrupt();
    assert_eq!(worker.join().unwrap(), ExceptionKind::KeyboardInterrupt);
}

/// Test: a pending call runs on the interpreter's own thread
#[test]
fn test_pending_call_from_other_thread() {
    let mut vm = Vm::new();
    let breaker = vm.eval_breaker();
    thread::spawn(move || {
        breaker.add_pending_call(|vm: &mut Vm| {
            vm.globals().insert("K", Value::Int(5));
            Ok(())
        });
    })
    .join()
    .unwrap();

    vm.globals().insert("K", Value::Int(1));
    let scaled = function(&vm, programs::scaled());
    // The first back edge runs the call, so K is 5 from the second iteration on.
    let result = vm.call(&scaled, vec![Value::Int(4)]).unwrap();
    assert_eq!(result, Value::Int(5 + 10 + 15));
}
