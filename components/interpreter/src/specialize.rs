//! Quickening: adaptive counters, specialization and deoptimization
//!
//! Each adaptive site counts down in its cache cell. When the counter runs
//! out the site is shown its live operands and either rewritten into a
//! specialized form (guard payload stored first, opcode second) or charged
//! a miss. Misses are cumulative per site: failed attempts and
//! deoptimizations both count, and enough of them switch the site off for
//! the life of the code unit.

use bytecode_system::{
    AttrCache, BinaryOperator, CacheCell, CallCache, CodeUnit, GlobalCache, Opcode,
};
use core_types::{Namespace, Value};
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::stats::SpecializationStats;

/// Count one execution of an adaptive site; `true` when it should try to
/// specialize now
#[inline]
pub(crate) fn tick(cache: &CacheCell) -> bool {
    if cache.is_disabled() {
        return false;
    }
    let counter = cache.counter();
    if counter <= 1 {
        return true;
    }
    cache.set_counter(counter - 1);
    false
}

/// Apply the outcome of a specialization attempt at `index`
///
/// `chosen` is the specialized form picked for the observed operands, with
/// its guard payload already written to the cache cell.
pub(crate) fn commit(
    code: &CodeUnit,
    index: usize,
    base: Opcode,
    chosen: Option<Opcode>,
    config: &EngineConfig,
    stats: &mut SpecializationStats,
) {
    stats.attempts += 1;
    match chosen {
        Some(specialized) if code.rewrite(index, base, specialized) => {
            stats.successes += 1;
            trace!(code = %code.qualname(), index, %specialized, "specialized");
        }
        _ => {
            stats.failures += 1;
            trace!(code = %code.qualname(), index, %base, "no specialization");
            charge_miss(code, index, config, stats);
        }
    }
}

/// Revert the specialized instruction at `index` after a guard failure
///
/// The caller then runs the generic path for this execution.
pub(crate) fn deoptimize(
    code: &CodeUnit,
    index: usize,
    specialized: Opcode,
    config: &EngineConfig,
    stats: &mut SpecializationStats,
) {
    let base = specialized.base();
    if !code.rewrite(index, specialized, base) {
        return;
    }
    stats.deopts += 1;
    debug!(code = %code.qualname(), index, %specialized, "deoptimized");
    let cache = code.cache(index);
    let misses = cache.record_miss();
    if misses >= config.max_specialization_misses {
        disable(code, index, stats);
    } else {
        cache.set_counter(config.adaptive_cooldown);
    }
}

fn charge_miss(code: &CodeUnit, index: usize, config: &EngineConfig, stats: &mut SpecializationStats) {
    let cache = code.cache(index);
    let misses = cache.record_miss();
    if misses >= config.max_specialization_misses {
        disable(code, index, stats);
    } else {
        cache.set_counter(config.backoff(misses));
    }
}

fn disable(code: &CodeUnit, index: usize, stats: &mut SpecializationStats) {
    let cache = code.cache(index);
    if cache.is_disabled() {
        return;
    }
    cache.disable();
    stats.disabled += 1;
    debug!(code = %code.qualname(), index, misses = cache.misses(), "site disabled");
}

/// Specialized `BINARY_OP` for the operand pair
pub(crate) fn binary_op(oparg: u32, left: &Value, right: &Value) -> Option<Opcode> {
    let op = BinaryOperator::from_oparg(oparg)?;
    match (left, right, op) {
        (Value::Int(_), Value::Int(_), BinaryOperator::Add) => Some(Opcode::BinaryOpAddInt),
        (Value::Int(_), Value::Int(_), BinaryOperator::Subtract) => {
            Some(Opcode::BinaryOpSubtractInt)
        }
        (Value::Int(_), Value::Int(_), BinaryOperator::Multiply) => {
            Some(Opcode::BinaryOpMultiplyInt)
        }
        (Value::Float(_), Value::Float(_), BinaryOperator::Add) => Some(Opcode::BinaryOpAddFloat),
        (Value::Float(_), Value::Float(_), BinaryOperator::Subtract) => {
            Some(Opcode::BinaryOpSubtractFloat)
        }
        (Value::Float(_), Value::Float(_), BinaryOperator::Multiply) => {
            Some(Opcode::BinaryOpMultiplyFloat)
        }
        (Value::Str(_), Value::Str(_), BinaryOperator::Add) => Some(Opcode::BinaryOpAddUnicode),
        _ => None,
    }
}

/// Specialized `COMPARE_OP` for the operand pair
pub(crate) fn compare_op(left: &Value, right: &Value) -> Option<Opcode> {
    match (left, right) {
        (Value::Int(_), Value::Int(_)) => Some(Opcode::CompareOpInt),
        (Value::Float(_), Value::Float(_)) => Some(Opcode::CompareOpFloat),
        (Value::Str(_), Value::Str(_)) => Some(Opcode::CompareOpStr),
        _ => None,
    }
}

/// Specialized `LOAD_ATTR` for `owner.name`, filling the attribute cache
pub(crate) fn load_attr(cache: &CacheCell, owner: &Value, name: &str) -> Option<Opcode> {
    match owner {
        Value::Instance(obj) => {
            let class = obj.class();
            let slot = class.slot_of(name)?;
            if !obj.has_slot(slot) {
                return None;
            }
            cache.set_attr(AttrCache {
                type_version: class.version(),
                index: slot as u32,
            });
            Some(Opcode::LoadAttrInstanceValue)
        }
        Value::Type(class) => {
            class.class_attr(name)?;
            cache.set_attr(AttrCache {
                type_version: class.version(),
                index: 0,
            });
            Some(Opcode::LoadAttrClass)
        }
        _ => None,
    }
}

/// Specialized `STORE_ATTR` for `owner.name = ...`
pub(crate) fn store_attr(cache: &CacheCell, owner: &Value, name: &str) -> Option<Opcode> {
    let Value::Instance(obj) = owner else {
        return None;
    };
    let class = obj.class();
    let slot = class.slot_of(name)?;
    cache.set_attr(AttrCache {
        type_version: class.version(),
        index: slot as u32,
    });
    Some(Opcode::StoreAttrInstanceValue)
}

/// Specialized `LOAD_GLOBAL` for `name`
pub(crate) fn load_global(
    cache: &CacheCell,
    name: &str,
    globals: &Namespace,
    builtins: &Namespace,
) -> Option<Opcode> {
    if let Some(index) = globals.index_of(name) {
        cache.set_global(GlobalCache {
            module_version: globals.keys_version(),
            builtins_version: 0,
            index: index as u32,
        });
        return Some(Opcode::LoadGlobalModule);
    }
    let index = builtins.index_of(name)?;
    cache.set_global(GlobalCache {
        module_version: globals.keys_version(),
        builtins_version: builtins.keys_version(),
        index: index as u32,
    });
    Some(Opcode::LoadGlobalBuiltin)
}

/// Specialized `FOR_ITER` for the iterator at TOS
pub(crate) fn for_iter(iterator: &Value) -> Option<Opcode> {
    match iterator {
        Value::RangeIter(_) => Some(Opcode::ForIterRange),
        Value::ListIter(_) => Some(Opcode::ForIterList),
        _ => None,
    }
}

/// Specialized `CALL` for a plain function called with its exact arity
pub(crate) fn call(cache: &CacheCell, callee: &Value, argc: u32) -> Option<Opcode> {
    let Value::Function(func) = callee else {
        return None;
    };
    let code = func.code();
    if code.arg_count() != argc || code.has_varargs() || code.is_generator() {
        return None;
    }
    cache.set_call(CallCache {
        func_version: func.version(),
    });
    Some(Opcode::CallPyExactArgs)
}
