//! The builtins namespace
//!
//! A small native library: enough of the usual functions for guest
//! programs to build, iterate and print values, plus the built-in
//! exception classes.

use std::cmp::Ordering;
use std::rc::Rc;

use bytecode_system::{BinaryOperator, ComparisonOperator};
use core_types::{
    type_error, value_error, Builtin, BuiltinFn, ExceptionKind, Interp, Namespace, Range, Unwind,
    Value,
};
use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive};

use crate::operations;

const FUNCTIONS: &[(&str, BuiltinFn)] = &[
    ("abs", builtin_abs),
    ("float", builtin_float),
    ("int", builtin_int),
    ("isinstance", builtin_isinstance),
    ("iter", builtin_iter),
    ("len", builtin_len),
    ("list", builtin_list),
    ("max", builtin_max),
    ("min", builtin_min),
    ("next", builtin_next),
    ("print", builtin_print),
    ("range", builtin_range),
    ("repr", builtin_repr),
    ("str", builtin_str),
    ("sum", builtin_sum),
    ("tuple", builtin_tuple),
];

/// Populate `builtins` with every native function and exception class
pub fn install(builtins: &Namespace) {
    for (name, func) in FUNCTIONS {
        builtins.insert(name, Value::Builtin(Builtin::new(name, *func)));
    }
    for kind in ExceptionKind::ALL {
        builtins.insert(kind.name(), Value::ExceptionType(*kind));
    }
}

/// Native method `name` of lists, unbound
pub(crate) fn list_method(name: &str) -> Option<Value> {
    let func: BuiltinFn = match name {
        "append" => list_append,
        "pop" => list_pop,
        _ => return None,
    };
    let name = if name == "append" { "append" } else { "pop" };
    Some(Value::Builtin(Builtin::new(name, func)))
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Unwind> {
    let given = args.len();
    if (min..=max).contains(&given) {
        return Ok(());
    }
    Err(type_error(if min == max {
        format!("{}() takes exactly {} argument(s) ({} given)", name, min, given)
    } else {
        format!(
            "{}() takes from {} to {} arguments ({} given)",
            name, min, max, given
        )
    }))
}

fn int_arg(name: &str, value: &Value) -> Result<i64, Unwind> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(type_error(format!(
            "{}() expected an integer, got '{}'",
            name,
            other.type_name()
        ))),
    }
}

fn collect(interp: &mut dyn Interp, iterable: &Value) -> Result<Vec<Value>, Unwind> {
    let iterator = interp.iterate(iterable)?;
    let mut items = Vec::new();
    while let Some(item) = interp.next_item(&iterator)? {
        items.push(item);
    }
    Ok(items)
}

fn builtin_range(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("range", args, 1, 3)?;
    let ints = args
        .iter()
        .map(|a| int_arg("range", a))
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity checked"),
    };
    if step == 0 {
        return Err(value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(Rc::new(Range { start, stop, step })))
}

fn builtin_len(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("len", args, 1, 1)?;
    let len = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Range(r) => r.len(),
        other => {
            return Err(type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(len as i64))
}

fn builtin_print(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    let line: Vec<String> = args.iter().map(Value::to_string).collect();
    let mut text = line.join(" ");
    text.push('\n');
    interp.write_output(&text);
    Ok(Value::None)
}

fn builtin_next(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("next", args, 1, 2)?;
    match interp.next_item(&args[0])? {
        Some(item) => Ok(item),
        None => match args.get(1) {
            Some(default) => Ok(default.clone()),
            None => Err(Unwind::raise(ExceptionKind::StopIteration, "")),
        },
    }
}

fn builtin_iter(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("iter", args, 1, 1)?;
    interp.iterate(&args[0])
}

fn builtin_list(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("list", args, 0, 1)?;
    match args.first() {
        Some(iterable) => Ok(Value::list(collect(interp, iterable)?)),
        None => Ok(Value::list(Vec::new())),
    }
}

fn builtin_tuple(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("tuple", args, 0, 1)?;
    match args.first() {
        Some(Value::Tuple(items)) => Ok(Value::Tuple(Rc::clone(items))),
        Some(iterable) => Ok(Value::tuple(collect(interp, iterable)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

fn builtin_str(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("str", args, 0, 1)?;
    Ok(match args.first() {
        Some(value @ Value::Str(_)) => value.clone(),
        Some(value) => Value::str(&value.to_string()),
        None => Value::str(""),
    })
}

fn builtin_repr(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("repr", args, 1, 1)?;
    Ok(Value::str(&args[0].repr()))
}

fn builtin_int(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("int", args, 0, 1)?;
    let Some(value) = args.first() else {
        return Ok(Value::Int(0));
    };
    match value {
        Value::Int(_) | Value::BigInt(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => {
            if f.is_nan() {
                return Err(value_error("cannot convert float NaN to integer"));
            }
            BigInt::from_f64(f.trunc())
                .map(Value::from_bigint)
                .ok_or_else(|| {
                    Unwind::raise(
                        ExceptionKind::OverflowError,
                        "cannot convert float infinity to integer",
                    )
                })
        }
        Value::Str(s) => s
            .trim()
            .parse::<BigInt>()
            .map(Value::from_bigint)
            .map_err(|_| value_error(format!("invalid literal for int() with base 10: {}", value.repr()))),
        other => Err(type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn builtin_float(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("float", args, 0, 1)?;
    let Some(value) = args.first() else {
        return Ok(Value::Float(0.0));
    };
    match value {
        Value::Float(_) => Ok(value.clone()),
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::BigInt(b) => b.to_f64().map(Value::Float).ok_or_else(|| {
            Unwind::raise(ExceptionKind::OverflowError, "int too large to convert to float")
        }),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| value_error(format!("could not convert string to float: {}", value.repr()))),
        other => Err(type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn builtin_abs(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("abs", args, 1, 1)?;
    match &args[0] {
        Value::Int(i) => Ok(match i.checked_abs() {
            Some(n) => Value::Int(n),
            None => Value::from_bigint(BigInt::from(*i).abs()),
        }),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::BigInt(b) => Ok(Value::from_bigint(b.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(type_error(format!(
            "bad operand type for abs(): '{}'",
            other.type_name()
        ))),
    }
}

fn extreme(
    name: &str,
    interp: &mut dyn Interp,
    args: &[Value],
    keep: Ordering,
) -> Result<Value, Unwind> {
    if args.is_empty() {
        return Err(type_error(format!("{}() expected at least 1 argument, got 0", name)));
    }
    let items = if args.len() == 1 {
        collect(interp, &args[0])?
    } else {
        args.to_vec()
    };
    let mut items = items.into_iter();
    let Some(mut best) = items.next() else {
        return Err(value_error(format!("{}() arg is an empty sequence", name)));
    };
    let op = if keep == Ordering::Less {
        ComparisonOperator::Less
    } else {
        ComparisonOperator::Greater
    };
    for item in items {
        if operations::compare(op, &item, &best)? {
            best = item;
        }
    }
    Ok(best)
}

fn builtin_min(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    extreme("min", interp, args, Ordering::Less)
}

fn builtin_max(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    extreme("max", interp, args, Ordering::Greater)
}

fn builtin_sum(interp: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("sum", args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    for item in collect(interp, &args[0])? {
        total = operations::binary_op(BinaryOperator::Add, &total, &item)?;
    }
    Ok(total)
}

fn is_instance(value: &Value, class: &Value) -> Result<bool, Unwind> {
    match (value, class) {
        (Value::Instance(obj), Value::Type(cls)) => Ok(Rc::ptr_eq(obj.class(), cls)),
        (_, Value::Type(_)) => Ok(false),
        (Value::Exception(exc), Value::ExceptionType(kind)) => Ok(exc.kind().is_subclass_of(*kind)),
        (_, Value::ExceptionType(_)) => Ok(false),
        (_, Value::Tuple(options)) => {
            for option in options.iter() {
                if is_instance(value, option)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error("isinstance() arg 2 must be a type or tuple of types")),
    }
}

fn builtin_isinstance(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("isinstance", args, 2, 2)?;
    Ok(Value::Bool(is_instance(&args[0], &args[1])?))
}

fn list_append(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("append", args, 2, 2)?;
    match &args[0] {
        Value::List(items) => {
            items.borrow_mut().push(args[1].clone());
            Ok(Value::None)
        }
        other => Err(type_error(format!(
            "descriptor 'append' requires a 'list' object but received a '{}'",
            other.type_name()
        ))),
    }
}

fn list_pop(_: &mut dyn Interp, args: &[Value]) -> Result<Value, Unwind> {
    arity("pop", args, 1, 2)?;
    let Value::List(items) = &args[0] else {
        return Err(type_error("pop() requires a list"));
    };
    let mut items = items.borrow_mut();
    if items.is_empty() {
        return Err(Unwind::raise(ExceptionKind::IndexError, "pop from empty list"));
    }
    let len = items.len() as i64;
    let raw = match args.get(1) {
        Some(index) => int_arg("pop", index)?,
        None => len - 1,
    };
    let at = if raw < 0 { raw + len } else { raw };
    if !(0..len).contains(&at) {
        return Err(Unwind::raise(ExceptionKind::IndexError, "pop index out of range"));
    }
    Ok(items.remove(at as usize))
}
