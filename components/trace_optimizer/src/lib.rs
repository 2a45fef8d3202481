//! Tier-2 trace recording and optimization
//!
//! This crate provides:
//! - [`TraceRecorder`]: translates the body of a hot loop into guarded uops
//!   while tier-1 executes it
//! - [`TraceOptimizer`]: guard elimination, constant folding and
//!   superinstruction fusion, producing an installable
//!   [`Executor`](bytecode_system::Executor)
//!
//! The interpreter drives both: it starts a recorder when a backward jump
//! gets hot, feeds it one [`Observation`] per instruction, and hands the
//! completed [`Trace`] to the optimizer.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytecode_system::{CodeBuilder, Constant, Opcode, UopId};
//! use core_types::{Namespace, Value};
//! use trace_optimizer::{Observation, RecordStatus, RecorderLimits, TraceOptimizer, TraceRecorder};
//!
//! let mut b = CodeBuilder::new("loop");
//! b.add_local("x");
//! let none = b.add_constant(Constant::None);
//! b.emit(Opcode::ReturnConst, none);
//! let code = b.build().unwrap();
//!
//! let (globals, builtins) = (Namespace::new(), Namespace::new());
//! let mut recorder = TraceRecorder::start(Arc::clone(&code), 0, 4, 1, RecorderLimits::default());
//! let stack = [Value::Int(1), Value::Int(2)];
//! let add = Observation {
//!     start: 2,
//!     index: 2,
//!     next: 3,
//!     opcode: Opcode::BinaryOp,
//!     oparg: 0,
//!     stack: &stack,
//!     globals: &globals,
//!     builtins: &builtins,
//! };
//! recorder.observe(&add);
//! let jump = Observation { start: 4, index: 4, next: 5, opcode: Opcode::JumpBackward, stack: &[], ..add };
//! let trace = match recorder.observe(&jump) {
//!     RecordStatus::Complete(trace) => trace,
//!     _ => unreachable!(),
//! };
//!
//! let executor = TraceOptimizer::new().optimize(trace);
//! assert_eq!(executor.uops()[1].id, UopId::GuardBothIntBinaryOpAddInt);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod facts;
pub mod fusion;
pub mod optimizer;
pub mod recorder;
pub mod trace;

// Re-export main types at crate root
pub use error::AbortReason;
pub use facts::{eliminate_guards, AbstractFrame, Fact, Kind};
pub use fusion::{fuse, Pattern, PATTERNS};
pub use optimizer::{fold_constants, remove_nops, OptimizerPasses, OptimizerStats, TraceOptimizer};
pub use recorder::{Observation, RecordStatus, RecorderLimits, TraceRecorder};
pub use trace::Trace;
