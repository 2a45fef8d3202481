//! Tiered bytecode interpreter
//!
//! This crate provides the execution engine:
//! - Tier-1 adaptive interpreter with inline caches and quickening
//! - Specialization with version-tag guards, deoptimization and backoff
//! - Tier-2 trace recording, optimization and executors with side exits
//! - Event monitoring with tool ids and legacy profile/trace hooks
//! - Eval breaker and interpreter lock for cross-thread requests
//!
//! # Example
//!
//! ```
//! use bytecode_system::{BinaryOperator, CodeBuilder, Constant, Opcode};
//! use core_types::Value;
//! use interpreter::Vm;
//!
//! let mut b = CodeBuilder::new("<module>");
//! let forty = b.add_constant(Constant::Int(40));
//! let two = b.add_constant(Constant::Int(2));
//! b.emit(Opcode::LoadConst, forty);
//! b.emit(Opcode::LoadConst, two);
//! b.emit(Opcode::BinaryOp, BinaryOperator::Add as u32);
//! b.emit(Opcode::ReturnValue, 0);
//! let code = b.build().unwrap();
//!
//! let mut vm = Vm::new();
//! assert_eq!(vm.run(&code).unwrap(), Value::Int(42));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builtins;
pub mod config;
mod dispatch;
pub mod error;
pub mod eval_breaker;
pub mod frame;
pub mod monitoring;
pub mod operations;
mod specialize;
pub mod stats;
mod tier2;
pub mod vm;

// Re-export main types at crate root
pub use config::EngineConfig;
pub use error::{EngineError, MonitoringError};
pub use eval_breaker::{EvalBreaker, InterpreterLock, LockGuard, PendingCall};
pub use frame::{Frame, FrameSnapshot, FrameState};
pub use monitoring::{Event, EventSet, Handler, Monitoring, Payload};
pub use stats::{EngineStats, SpecializationStats, Tier2Stats};
pub use vm::Vm;
