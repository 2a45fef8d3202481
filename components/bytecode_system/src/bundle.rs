//! Serialized code bundles: the interface to the compiler
//!
//! A bundle is the immutable output of compilation. It is plain data
//! (serde, JSON on disk) and only becomes executable once
//! [`CodeUnit::from_bundle`](crate::CodeUnit::from_bundle) has validated it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code::{CodeFlags, CodeUnit, ExceptionEntry, SlotKind};
use crate::validate::MalformedCodeError;

/// Errors loading a serialized bundle
#[derive(Debug, Error)]
pub enum BundleError {
    /// The text is not a valid bundle document
    #[error("invalid bundle document: {0}")]
    Json(#[from] serde_json::Error),
    /// The bundle decoded but is not well formed
    #[error("malformed code: {0}")]
    Malformed(#[from] MalformedCodeError),
}

/// Serialized constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantSpec {
    /// `None`
    None,
    /// Boolean
    Bool(bool),
    /// Machine int
    Int(i64),
    /// Arbitrary precision int in decimal
    BigInt(String),
    /// Float
    Float(f64),
    /// String
    Str(String),
    /// Tuple
    Tuple(Vec<ConstantSpec>),
    /// Nested code
    Code(Box<CodeBundle>),
}

/// Serialized variable slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Variable name
    pub name: String,
    /// Classification bitmask
    pub kind: SlotKind,
}

/// Run of consecutive instruction words sharing one source line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRun {
    /// First instruction index
    pub start: u32,
    /// Number of instruction words
    pub length: u32,
    /// Source line
    pub line: u32,
}

fn default_filename() -> String {
    "<unknown>".to_string()
}

/// Compiler output for one code unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBundle {
    /// Function name
    pub name: String,
    /// Qualified name; defaults to `name`
    #[serde(default)]
    pub qualname: Option<String>,
    /// Source file
    #[serde(default = "default_filename")]
    pub filename: String,
    /// First source line
    #[serde(default)]
    pub first_line: u32,
    /// Instruction bytes, two per word
    pub code: Vec<u8>,
    /// Constant pool
    #[serde(default)]
    pub constants: Vec<ConstantSpec>,
    /// Name pool
    #[serde(default)]
    pub names: Vec<String>,
    /// Variable slots
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
    /// Number of positional parameters
    #[serde(default)]
    pub arg_count: u32,
    /// Operand stack bound
    pub stack_size: u32,
    /// Flags
    #[serde(default)]
    pub flags: CodeFlags,
    /// Line table
    #[serde(default)]
    pub line_table: Vec<LineRun>,
    /// Exception table
    #[serde(default)]
    pub exception_table: Vec<ExceptionEntry>,
}

impl CodeBundle {
    /// Parse a JSON bundle
    pub fn from_json(text: &str) -> Result<Self, BundleError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render as pretty JSON
    pub fn to_json(&self) -> Result<String, BundleError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate in one step
    pub fn load(text: &str) -> Result<Arc<CodeUnit>, BundleError> {
        let bundle = Self::from_json(text)?;
        Ok(CodeUnit::from_bundle(&bundle)?)
    }
}
