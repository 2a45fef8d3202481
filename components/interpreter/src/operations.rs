//! Generic semantics of the value operations
//!
//! Specialized instructions and tier-2 uops are fast paths over these
//! functions; whenever a guard fails, execution lands here. None of these
//! functions call back into guest code.

use std::cmp::Ordering;
use std::rc::Rc;

use bytecode_system::{BinaryOperator, ComparisonOperator};
use core_types::{
    type_error, BoundMethod, ExceptionKind, ListIter, SeqIter, Unwind, Value,
};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::builtins;

enum Number {
    Small(i64),
    Big(BigInt),
    Float(f64),
}

fn number(value: &Value) -> Option<Number> {
    match value {
        Value::Int(i) => Some(Number::Small(*i)),
        Value::Bool(b) => Some(Number::Small(*b as i64)),
        Value::BigInt(b) => Some(Number::Big(b.as_ref().clone())),
        Value::Float(f) => Some(Number::Float(*f)),
        _ => None,
    }
}

fn to_big(n: &Number) -> BigInt {
    match n {
        Number::Small(i) => BigInt::from(*i),
        Number::Big(b) => b.clone(),
        Number::Float(f) => BigInt::from(*f as i64),
    }
}

fn to_float(n: &Number) -> f64 {
    match n {
        Number::Small(i) => *i as f64,
        Number::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
        Number::Float(f) => *f,
    }
}

fn zero_division(message: &str) -> Unwind {
    Unwind::raise(ExceptionKind::ZeroDivisionError, message)
}

fn unsupported(op: BinaryOperator, left: &Value, right: &Value) -> Unwind {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

/// `left <op> right`
pub fn binary_op(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value, Unwind> {
    if let (Some(a), Some(b)) = (number(left), number(right)) {
        return numeric_op(op, a, b);
    }
    match (op, left, right) {
        (BinaryOperator::Add, Value::Str(a), Value::Str(b)) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::Str(Rc::from(joined)))
        }
        (BinaryOperator::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (BinaryOperator::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (BinaryOperator::Multiply, Value::Str(s), count)
        | (BinaryOperator::Multiply, count, Value::Str(s)) => match repeat_count(count) {
            Some(n) => Ok(Value::Str(Rc::from(s.repeat(n)))),
            None => Err(unsupported(op, left, right)),
        },
        (BinaryOperator::Multiply, Value::List(items), count)
        | (BinaryOperator::Multiply, count, Value::List(items)) => match repeat_count(count) {
            Some(n) => {
                let items = items.borrow();
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::list(out))
            }
            None => Err(unsupported(op, left, right)),
        },
        _ => Err(unsupported(op, left, right)),
    }
}

fn repeat_count(value: &Value) -> Option<usize> {
    match value {
        Value::Int(n) => Some((*n).max(0) as usize),
        Value::Bool(b) => Some(*b as usize),
        _ => None,
    }
}

fn numeric_op(op: BinaryOperator, a: Number, b: Number) -> Result<Value, Unwind> {
    if matches!(a, Number::Float(_)) || matches!(b, Number::Float(_)) {
        return float_op(op, to_float(&a), to_float(&b));
    }
    if op == BinaryOperator::TrueDivide {
        let (x, y) = (to_float(&a), to_float(&b));
        if y == 0.0 {
            return Err(zero_division("division by zero"));
        }
        return Ok(Value::Float(x / y));
    }
    if let (Number::Small(x), Number::Small(y)) = (&a, &b) {
        if let Some(result) = small_int_op(op, *x, *y)? {
            return Ok(Value::Int(result));
        }
    }
    big_int_op(op, to_big(&a), to_big(&b))
}

/// Machine-integer arithmetic; `Ok(None)` on overflow
fn small_int_op(op: BinaryOperator, x: i64, y: i64) -> Result<Option<i64>, Unwind> {
    Ok(match op {
        BinaryOperator::Add => x.checked_add(y),
        BinaryOperator::Subtract => x.checked_sub(y),
        BinaryOperator::Multiply => x.checked_mul(y),
        BinaryOperator::FloorDivide => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            x.checked_div(y).map(|q| {
                if (x % y != 0) && ((x < 0) != (y < 0)) {
                    q - 1
                } else {
                    q
                }
            })
        }
        BinaryOperator::Remainder => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            x.checked_rem(y).map(|r| if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r })
        }
        BinaryOperator::Power => {
            if y < 0 {
                return Ok(None);
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
        BinaryOperator::TrueDivide => None,
    })
}

fn big_int_op(op: BinaryOperator, x: BigInt, y: BigInt) -> Result<Value, Unwind> {
    let result = match op {
        BinaryOperator::Add => x + y,
        BinaryOperator::Subtract => x - y,
        BinaryOperator::Multiply => x * y,
        BinaryOperator::FloorDivide | BinaryOperator::Remainder => {
            if y.is_zero() {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let mut q = &x / &y;
            let mut r = &x % &y;
            if !r.is_zero() && (r.is_negative() != y.is_negative()) {
                q -= 1;
                r += &y;
            }
            if op == BinaryOperator::FloorDivide {
                q
            } else {
                r
            }
        }
        BinaryOperator::Power => {
            if y.is_negative() {
                let base = x.to_f64().unwrap_or(f64::INFINITY);
                let exp = y.to_f64().unwrap_or(f64::NEG_INFINITY);
                return float_op(BinaryOperator::Power, base, exp);
            }
            match y.to_u32() {
                Some(exp) => x.pow(exp),
                None => {
                    return Err(Unwind::raise(
                        ExceptionKind::OverflowError,
                        "exponent too large",
                    ))
                }
            }
        }
        BinaryOperator::TrueDivide => {
            return numeric_op(op, Number::Big(x), Number::Big(y));
        }
    };
    Ok(Value::from_bigint(result))
}

fn float_op(op: BinaryOperator, x: f64, y: f64) -> Result<Value, Unwind> {
    let result = match op {
        BinaryOperator::Add => x + y,
        BinaryOperator::Subtract => x - y,
        BinaryOperator::Multiply => x * y,
        BinaryOperator::TrueDivide => {
            if y == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            x / y
        }
        BinaryOperator::FloorDivide => {
            if y == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinaryOperator::Remainder => {
            if y == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                r + y
            } else {
                r
            }
        }
        BinaryOperator::Power => {
            if x == 0.0 && y < 0.0 {
                return Err(zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(result))
}

/// `-value`
pub fn negate(value: &Value) -> Result<Value, Unwind> {
    match number(value) {
        Some(Number::Small(i)) => Ok(match i.checked_neg() {
            Some(n) => Value::Int(n),
            None => Value::from_bigint(-BigInt::from(i)),
        }),
        Some(Number::Big(b)) => Ok(Value::from_bigint(-b)),
        Some(Number::Float(f)) => Ok(Value::Float(-f)),
        None => Err(type_error(format!(
            "bad operand type for unary -: '{}'",
            value.type_name()
        ))),
    }
}

/// Equality as `==` sees it
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (number(left), number(right)) {
        (Some(a), Some(b)) => compare_numbers(&a, &b) == Some(Ordering::Equal),
        _ => left == right,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    match (a, b) {
        (Number::Small(x), Number::Small(y)) => Some(x.cmp(y)),
        (Number::Float(_), _) | (_, Number::Float(_)) => to_float(a).partial_cmp(&to_float(b)),
        _ => Some(to_big(a).cmp(&to_big(b))),
    }
}

fn ordering(op: ComparisonOperator, left: &Value, right: &Value) -> Result<Option<Ordering>, Unwind> {
    if let (Some(a), Some(b)) = (number(left), number(right)) {
        return Ok(compare_numbers(&a, &b));
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => sequence_ordering(op, a, b),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            sequence_ordering(op, &a, &b)
        }
        _ => Err(type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn sequence_ordering(
    op: ComparisonOperator,
    a: &[Value],
    b: &[Value],
) -> Result<Option<Ordering>, Unwind> {
    for (x, y) in a.iter().zip(b) {
        if !values_equal(x, y) {
            return ordering(op, x, y);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// `a <op> b` on two floats; NaN is unordered and unequal to everything
#[inline]
pub fn compare_floats(op: ComparisonOperator, a: f64, b: f64) -> bool {
    match op {
        ComparisonOperator::Equal => a == b,
        ComparisonOperator::NotEqual => a != b,
        _ => a.partial_cmp(&b).map_or(false, |o| op.matches(o)),
    }
}

/// `left <op> right`
pub fn compare(op: ComparisonOperator, left: &Value, right: &Value) -> Result<bool, Unwind> {
    match op {
        ComparisonOperator::Equal => Ok(values_equal(left, right)),
        ComparisonOperator::NotEqual => Ok(!values_equal(left, right)),
        _ => Ok(ordering(op, left, right)?.map_or(false, |o| op.matches(o))),
    }
}

fn normalize_index(index: &Value, len: usize) -> Result<Option<usize>, Unwind> {
    let raw = match index {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        other => {
            return Err(type_error(format!(
                "indices must be integers, not {}",
                other.type_name()
            )))
        }
    };
    let adjusted = if raw < 0 { raw + len as i64 } else { raw };
    Ok((0..len as i64).contains(&adjusted).then_some(adjusted as usize))
}

fn index_error(what: &str) -> Unwind {
    Unwind::raise(ExceptionKind::IndexError, format!("{} index out of range", what))
}

/// `container[index]`
pub fn subscript(container: &Value, index: &Value) -> Result<Value, Unwind> {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let at = normalize_index(index, items.len())?.ok_or_else(|| index_error("list"))?;
            Ok(items[at].clone())
        }
        Value::Tuple(items) => {
            let at = normalize_index(index, items.len())?.ok_or_else(|| index_error("tuple"))?;
            Ok(items[at].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let at = normalize_index(index, chars.len())?.ok_or_else(|| index_error("string"))?;
            Ok(Value::str(&chars[at].to_string()))
        }
        Value::Range(r) => {
            let at = normalize_index(index, r.len())?.ok_or_else(|| index_error("range object"))?;
            Ok(Value::Int(r.start + r.step * at as i64))
        }
        other => Err(type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

/// Iterator over `value`; iterators are their own iterators
pub fn get_iter(value: &Value) -> Result<Value, Unwind> {
    match value {
        Value::Range(r) => Ok(Value::RangeIter(Rc::new(r.iter()))),
        Value::List(items) => Ok(Value::ListIter(Rc::new(ListIter::new(Rc::clone(items))))),
        Value::Tuple(items) => Ok(Value::SeqIter(Rc::new(SeqIter::new(Rc::clone(items))))),
        Value::Str(s) => {
            let chars: Vec<Value> = s.chars().map(|c| Value::str(&c.to_string())).collect();
            Ok(Value::SeqIter(Rc::new(SeqIter::new(Rc::from(chars)))))
        }
        Value::RangeIter(_) | Value::ListIter(_) | Value::SeqIter(_) | Value::Generator(_) => {
            Ok(value.clone())
        }
        other => Err(type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Advance a native iterator
///
/// Returns `None` when `iterator` is not a native iterator (generators are
/// resumed by the interpreter), otherwise the next item or `Some(None)`.
pub fn next_native(iterator: &Value) -> Option<Option<Value>> {
    match iterator {
        Value::RangeIter(it) => Some(it.next_value().map(Value::Int)),
        Value::ListIter(it) => Some(it.next_value()),
        Value::SeqIter(it) => Some(it.next_value()),
        _ => None,
    }
}

fn no_attribute(owner: &Value, name: &str) -> Unwind {
    let message = match owner {
        Value::Type(class) => format!("type object '{}' has no attribute '{}'", class.name(), name),
        other => format!("'{}' object has no attribute '{}'", other.type_name(), name),
    };
    Unwind::raise(ExceptionKind::AttributeError, message)
}

/// `owner.name`
pub fn load_attr(owner: &Value, name: &str) -> Result<Value, Unwind> {
    match owner {
        Value::Instance(obj) => {
            let class = obj.class();
            if let Some(value) = class.slot_of(name).and_then(|slot| obj.slot(slot)) {
                return Ok(value);
            }
            match class.class_attr(name) {
                Some(func @ Value::Function(_)) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                    receiver: owner.clone(),
                    function: func,
                }))),
                Some(value) => Ok(value),
                None => Err(no_attribute(owner, name)),
            }
        }
        Value::Type(class) => class.class_attr(name).ok_or_else(|| no_attribute(owner, name)),
        Value::List(_) => match builtins::list_method(name) {
            Some(method) => Ok(Value::BoundMethod(Rc::new(BoundMethod {
                receiver: owner.clone(),
                function: method,
            }))),
            None => Err(no_attribute(owner, name)),
        },
        Value::Exception(exc) if name == "args" => {
            Ok(Value::tuple(vec![Value::str(exc.message())]))
        }
        _ => Err(no_attribute(owner, name)),
    }
}

/// `owner.name = value`
pub fn store_attr(owner: &Value, name: &str, value: Value) -> Result<(), Unwind> {
    match owner {
        Value::Instance(obj) => {
            obj.set_attr(name, value);
            Ok(())
        }
        Value::Type(class) => {
            class.set_class_attr(name, value);
            Ok(())
        }
        _ => Err(no_attribute(owner, name)),
    }
}

/// Whether the exception `exc` is caught by `pattern` (a type or tuple of types)
pub fn exception_matches(exc: &Value, pattern: &Value) -> Result<bool, Unwind> {
    let kind = match exc {
        Value::Exception(e) => e.kind(),
        _ => return Ok(false),
    };
    match pattern {
        Value::ExceptionType(target) => Ok(kind.is_subclass_of(*target)),
        Value::Tuple(options) => {
            for option in options.iter() {
                if exception_matches(exc, option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}
