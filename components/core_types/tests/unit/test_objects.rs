//! Unit tests for heap objects and the ownership facade

use core_types::ownership::{ref_count, release, retain, type_of, version_tag_of};
use core_types::{CellObj, Exception, ExceptionKind, Instance, Namespace, TypeObject, TypeTag, Value};

#[test]
fn test_class_attr_delete_bumps() {
    let class = TypeObject::new("C");
    class.set_class_attr("a", Value::Int(1));
    let v = class.version();
    assert_eq!(class.del_class_attr("a"), Some(Value::Int(1)));
    assert_ne!(class.version(), v);
    assert_eq!(class.class_attr("a"), None);
}

#[test]
fn test_instances_share_layout() {
    let class = TypeObject::new("P");
    let a = Instance::new(&class);
    let b = Instance::new(&class);
    a.set_attr("x", Value::Int(1));
    let v = class.version();
    b.set_attr("x", Value::Int(2));
    assert_eq!(class.version(), v);
    assert_eq!(class.slot_of("x"), Some(0));
    assert!(b.has_slot(0));
    assert_eq!(a.slot(0), Some(Value::Int(1)));
}

#[test]
fn test_instance_release_through_values() {
    let class = TypeObject::new("Tracked");
    let obj = Value::Instance(Instance::new(&class));
    let copy = retain(&obj);
    assert_eq!(ref_count(&obj), Some(2));
    release(copy);
    assert_eq!(class.live_instances(), 1);
    release(obj);
    assert_eq!(class.live_instances(), 0);
}

#[test]
fn test_namespace_version_via_facade() {
    let ns = Namespace::new();
    let v = version_tag_of(ns.as_ref());
    ns.insert("g", Value::Int(0));
    assert_ne!(version_tag_of(ns.as_ref()), v);
    assert_eq!(type_of(&ns.get("g").unwrap()), TypeTag::Int);
}

#[test]
fn test_cells() {
    let cell = CellObj::new(None);
    assert_eq!(cell.get(), None);
    cell.set(Value::str("v"));
    assert_eq!(cell.get(), Some(Value::str("v")));
}

#[test]
fn test_exception_display() {
    let exc = Exception::new(ExceptionKind::ZeroDivisionError, "division by zero");
    assert_eq!(exc.to_string(), "ZeroDivisionError: division by zero");
    assert_eq!(Value::Exception(exc).type_name(), "ZeroDivisionError");
}
