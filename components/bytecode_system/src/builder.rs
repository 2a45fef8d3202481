//! Small assembler producing code bundles
//!
//! Stands in for a compiler front end: tests and tools describe code with
//! labels and symbolic slots, and the builder resolves jump offsets,
//! inserts `EXTENDED_ARG` prefixes for wide operands and computes the
//! stack bound.

use std::sync::Arc;

use crate::bundle::{CodeBundle, ConstantSpec, LineRun, SlotSpec};
use crate::code::{CodeFlags, CodeUnit, Constant, ExceptionEntry, SlotKind};
use crate::opcode::Opcode;
use crate::validate::{self, Layout, MalformedCodeError};

/// Jump target placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Operand {
    Immediate(u32),
    Jump(Label),
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    opcode: Opcode,
    operand: Operand,
    line: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    start: Label,
    end: Label,
    target: Label,
    depth: u32,
    lasti: bool,
}

/// Assembler for one code unit
#[derive(Debug, Clone)]
pub struct CodeBuilder {
    name: String,
    filename: String,
    first_line: u32,
    instructions: Vec<Pending>,
    labels: Vec<Option<usize>>,
    constants: Vec<ConstantSpec>,
    names: Vec<String>,
    slots: Vec<SlotSpec>,
    arg_count: u32,
    flags: CodeFlags,
    handlers: Vec<Handler>,
    line: Option<u32>,
}

fn prefix_words(arg: u32) -> usize {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

impl CodeBuilder {
    /// Start a new code unit
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            filename: "<builder>".to_string(),
            first_line: 1,
            instructions: Vec::new(),
            labels: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            slots: Vec::new(),
            arg_count: 0,
            flags: CodeFlags::default(),
            handlers: Vec::new(),
            line: None,
        }
    }

    /// Set the source file name
    pub fn filename(&mut self, filename: &str) -> &mut Self {
        self.filename = filename.to_string();
        self
    }

    /// Declare the number of positional parameters
    pub fn arg_count(&mut self, count: u32) -> &mut Self {
        self.arg_count = count;
        self
    }

    /// Mark the code as a generator body
    pub fn generator(&mut self) -> &mut Self {
        self.flags = CodeFlags(self.flags.0 | CodeFlags::GENERATOR.0);
        self
    }

    /// Source line attached to subsequently emitted instructions
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        if self.line.is_none() && self.instructions.is_empty() {
            self.first_line = line;
        }
        self.line = Some(line);
        self
    }

    /// Add a constant, returning its pool index
    pub fn add_constant(&mut self, constant: Constant) -> u32 {
        let spec = constant.to_spec();
        if let Some(index) = self.constants.iter().position(|c| *c == spec) {
            return index as u32;
        }
        self.constants.push(spec);
        (self.constants.len() - 1) as u32
    }

    /// Intern a name, returning its pool index
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return index as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    /// Declare a variable slot, returning its index
    pub fn add_slot(&mut self, name: &str, kind: SlotKind) -> u32 {
        if let Some(index) = self.slots.iter().position(|s| s.name == name) {
            return index as u32;
        }
        self.slots.push(SlotSpec {
            name: name.to_string(),
            kind,
        });
        (self.slots.len() - 1) as u32
    }

    /// Declare a positional parameter or plain local
    ///
    /// The first `arg_count` slots are treated as parameters.
    pub fn add_local(&mut self, name: &str) -> u32 {
        let kind = if (self.slots.len() as u32) < self.arg_count {
            SlotKind::POS_OR_KW
        } else {
            SlotKind::LOCAL
        };
        self.add_slot(name, kind)
    }

    /// Allocate an unbound label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.instructions.len());
        self
    }

    /// Emit an instruction with an immediate operand
    pub fn emit(&mut self, opcode: Opcode, oparg: u32) -> &mut Self {
        self.instructions.push(Pending {
            opcode,
            operand: Operand::Immediate(oparg),
            line: self.line,
        });
        self
    }

    /// Emit a jump to `label`
    pub fn emit_jump(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        self.instructions.push(Pending {
            opcode,
            operand: Operand::Jump(label),
            line: self.line,
        });
        self
    }

    /// Cover `[start, end)` with a handler at `target`
    pub fn add_handler(
        &mut self,
        start: Label,
        end: Label,
        target: Label,
        depth: u32,
        lasti: bool,
    ) -> &mut Self {
        self.handlers.push(Handler {
            start,
            end,
            target,
            depth,
            lasti,
        });
        self
    }

    fn label_position(&self, label: Label, starts: &[usize], words: usize) -> u32 {
        self.labels[label.0]
            .map(|pending| starts.get(pending).copied().unwrap_or(words))
            .unwrap_or(words) as u32
    }

    /// Resolve labels and produce the bundle
    ///
    /// Jump offsets and operand widths depend on each other, so sizes are
    /// iterated to a fixed point.
    pub fn to_bundle(&self) -> Result<CodeBundle, MalformedCodeError> {
        let count = self.instructions.len();
        let mut sizes = vec![1usize; count];
        let mut starts = vec![0usize; count];
        let mut args = vec![0u32; count];
        loop {
            let mut offset = 0;
            for (i, size) in sizes.iter().enumerate() {
                starts[i] = offset;
                offset += size;
            }
            let words = offset;
            let mut changed = false;
            for (i, pending) in self.instructions.iter().enumerate() {
                let arg = match pending.operand {
                    Operand::Immediate(arg) => arg,
                    Operand::Jump(label) => {
                        let target = self.label_position(label, &starts, words) as i64;
                        let next = (starts[i] + sizes[i]) as i64;
                        if pending.opcode.is_backward_jump() {
                            (next - target).max(0) as u32
                        } else {
                            (target - next).max(0) as u32
                        }
                    }
                };
                args[i] = arg;
                let size = prefix_words(arg);
                if size > sizes[i] {
                    sizes[i] = size;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut code = Vec::new();
        let mut line_table: Vec<LineRun> = Vec::new();
        for (i, pending) in self.instructions.iter().enumerate() {
            let arg = args[i];
            for shift in (1..sizes[i]).rev() {
                code.push(Opcode::ExtendedArg as u8);
                code.push(((arg >> (8 * shift)) & 0xff) as u8);
            }
            code.push(pending.opcode as u8);
            code.push((arg & 0xff) as u8);
            if let Some(line) = pending.line {
                let start = starts[i] as u32;
                match line_table.last_mut() {
                    Some(run) if run.line == line && run.start + run.length == start => {
                        run.length += sizes[i] as u32;
                    }
                    _ => line_table.push(LineRun {
                        start,
                        length: sizes[i] as u32,
                        line,
                    }),
                }
            }
        }

        let words = code.len() / 2;
        let exception_table = self
            .handlers
            .iter()
            .map(|h| ExceptionEntry {
                start: self.label_position(h.start, &starts, words),
                end: self.label_position(h.end, &starts, words),
                target: self.label_position(h.target, &starts, words),
                depth: h.depth,
                lasti: h.lasti,
            })
            .collect::<Vec<_>>();

        let decoded = validate::decode_stream(&code)?;
        let layout = Layout {
            constants: self.constants.len(),
            names: self.names.len(),
            slots: self.slots.len(),
            arg_count: self.arg_count,
            generator: self.flags.contains(CodeFlags::GENERATOR),
            stack_size: None,
            exception_table: &exception_table,
        };
        let analysis = validate::validate(&decoded, words, &layout)?;

        Ok(CodeBundle {
            name: self.name.clone(),
            qualname: None,
            filename: self.filename.clone(),
            first_line: self.first_line,
            code,
            constants: self.constants.clone(),
            names: self.names.clone(),
            slots: self.slots.clone(),
            arg_count: self.arg_count,
            stack_size: analysis.max_depth,
            flags: self.flags,
            line_table,
            exception_table,
        })
    }

    /// Resolve, validate and build the code unit
    pub fn build(&self) -> Result<Arc<CodeUnit>, MalformedCodeError> {
        CodeUnit::from_bundle(&self.to_bundle()?)
    }
}
