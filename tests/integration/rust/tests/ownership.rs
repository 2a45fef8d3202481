//! Ownership Integration Tests
//!
//! Every tier must balance its references: objects created by a program
//! are gone once the program's frames are, whatever ran them.

use std::rc::Rc;

use core_types::ownership::{ref_count, release, retain, type_of, version_tag_of};
use core_types::{TypeObject, TypeTag, Value};
use integration_tests::{configs, function, programs};
use interpreter::{EngineConfig, Vm};

/// Test: instances created in a loop are all released on every tier
#[test]
fn test_instances_released_on_every_tier() {
    for (name, config) in configs() {
        let mut vm = Vm::with_config(config);
        let class = TypeObject::new("Point");
        vm.globals().insert("Point", Value::Type(Rc::clone(&class)));
        let make = function(&vm, programs::make_points());
        for _ in 0..3 {
            let result = vm.call(&make, vec![Value::Int(100)]).unwrap();
            assert_eq!(result, Value::Int(4950), "config {}", name);
            assert_eq!(class.live_instances(), 0, "config {}", name);
        }
    }
}

/// Test: an uncaught exception unwinds without leaking frame contents
#[test]
fn test_unwinding_releases_locals() {
    let mut vm = Vm::with_config(EngineConfig::eager());
    let class = TypeObject::new("Point");
    vm.globals().insert("Point", Value::Type(Rc::clone(&class)));
    let make = function(&vm, programs::make_points());
    // range() rejects the string argument.
    assert!(vm.call(&make, vec![Value::str("x")]).is_err());
    assert_eq!(class.live_instances(), 0);
}

/// Test: a list passed through a traced loop keeps a balanced count
#[test]
fn test_argument_refcount_balanced() {
    for (name, config) in configs() {
        let mut vm = Vm::with_config(config);
        let total = function(&vm, programs::total());
        let items = Value::list((0..50).map(Value::Int).collect());
        let before = ref_count(&items);
        for _ in 0..5 {
            vm.call(&total, vec![retain(&items)]).unwrap();
        }
        assert_eq!(ref_count(&items), before, "config {}", name);
    }
}

/// Test: the facade's retain/release pair and queries
#[test]
fn test_facade_pairs() {
    let text = Value::str("shared");
    assert_eq!(ref_count(&text), Some(1));
    let extra = retain(&text);
    assert_eq!(ref_count(&text), Some(2));
    release(extra);
    assert_eq!(ref_count(&text), Some(1));
    assert_eq!(ref_count(&Value::Int(1)), None);
    assert_eq!(type_of(&text), TypeTag::Str);

    let class = TypeObject::new("C");
    let before = version_tag_of(class.as_ref());
    class.set_class_attr("a", Value::Int(1));
    assert_ne!(version_tag_of(class.as_ref()), before);
}
