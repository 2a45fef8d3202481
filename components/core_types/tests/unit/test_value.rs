//! Unit tests for Value

use std::rc::Rc;
use std::sync::Arc;

use core_types::{ExceptionKind, TypeTag, Value};

#[test]
fn test_type_tags() {
    assert_eq!(Value::None.type_tag(), TypeTag::NoneType);
    assert_eq!(Value::Int(1).type_tag(), TypeTag::Int);
    assert_eq!(Value::Float(1.0).type_tag(), TypeTag::Float);
    assert_eq!(Value::str("s").type_tag(), TypeTag::Str);
    assert_eq!(
        Value::ExceptionType(ExceptionKind::KeyError).type_tag(),
        TypeTag::ExceptionType
    );
}

#[test]
fn test_identity_differs_from_equality_for_lists() {
    let a = Value::list(vec![Value::Int(1)]);
    let b = Value::list(vec![Value::Int(1)]);
    assert_eq!(a, b);
    assert!(!a.is(&b));
    assert!(a.is(&a.clone()));
}

#[test]
fn test_list_repr_nests() {
    let inner = Value::list(vec![Value::str("x")]);
    let outer = Value::list(vec![Value::Int(1), inner, Value::None]);
    assert_eq!(outer.to_string(), "[1, ['x'], None]");
}

#[test]
fn test_clone_shares_string_storage() {
    let s = Value::str("shared");
    let t = s.clone();
    match (&s, &t) {
        (Value::Str(a), Value::Str(b)) => assert!(Rc::ptr_eq(a, b)),
        _ => unreachable!(),
    }
}

#[test]
fn test_code_constant_value() {
    let constant = bytecode_system::Constant::Str(Arc::from("k"));
    assert_eq!(Value::from_constant(&constant), Value::str("k"));
}

#[test]
fn test_bool_display() {
    assert_eq!(Value::Bool(true).to_string(), "True");
    assert_eq!(Value::from(false).to_string(), "False");
}
