//! Re-entry surface native code uses to call back into the engine.

use crate::error::Unwind;
use crate::value::Value;

/// Services a running interpreter offers to builtins
pub trait Interp {
    /// Call any callable, pushing a nested frame for bytecode functions
    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, Unwind>;

    /// Advance an iterator; `Ok(None)` when exhausted
    fn next_item(&mut self, iterator: &Value) -> Result<Option<Value>, Unwind>;

    /// Obtain an iterator over `value`
    fn iterate(&mut self, value: &Value) -> Result<Value, Unwind>;

    /// Append text to the program's output stream
    fn write_output(&mut self, text: &str);
}
