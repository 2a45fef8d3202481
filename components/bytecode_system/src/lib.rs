//! Bytecode model for the tiered execution engine
//!
//! This crate defines everything the engine tiers share about code: the
//! instruction set, validated code units with their inline caches, the
//! serialized bundle format produced by compilers, version tags used for
//! lazy invalidation, and the micro-operation set executed by tier-2
//! executors.
//!
//! # Features
//!
//! - Two-byte instruction words with `EXTENDED_ARG` prefixes
//! - Structural validation and stack-depth analysis of compiler output
//! - Lock-free in-place quickening of instruction cells
//! - Co-indexed inline cache cells and an executor table per code unit
//!
//! # Example
//!
//! ```
//! use bytecode_system::{CodeBuilder, Constant, Opcode};
//!
//! let mut builder = CodeBuilder::new("answer");
//! let k = builder.add_constant(Constant::Int(42));
//! builder.emit(Opcode::LoadConst, k);
//! builder.emit(Opcode::ReturnValue, 0);
//!
//! let code = builder.build().unwrap();
//! assert_eq!(code.len(), 2);
//! assert!(code.disassemble().contains("LOAD_CONST"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod bundle;
pub mod code;
pub mod disassembler;
pub mod executor;
pub mod instruction;
pub mod opcode;
pub mod uop;
pub mod validate;
pub mod version;

// Re-export main types at crate root
pub use builder::{CodeBuilder, Label};
pub use bundle::{BundleError, CodeBundle, ConstantSpec, LineRun, SlotSpec};
pub use code::{CodeFlags, CodeUnit, Constant, ExceptionEntry, Slot, SlotKind};
pub use executor::Executor;
pub use instruction::{AttrCache, CacheCell, CallCache, GlobalCache, Instruction, InstructionCell};
pub use opcode::{BinaryOperator, ComparisonOperator, Opcode};
pub use uop::{pack_pair, unpack_pair, UopId, UopInstruction, UopKind};
pub use validate::{Decoded, MalformedCodeError};
pub use version::{next_version, VersionTag};
