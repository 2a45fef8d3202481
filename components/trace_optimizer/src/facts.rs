//! Abstract interpretation over a trace
//!
//! Tracks what is statically known about each operand stack entry and local
//! slot while walking the trace once from top to bottom. A guard whose
//! condition is already implied by the facts is replaced with `_NOP`.
//! Nothing is assumed at the loop head: facts never flow around the back
//! edge.

use bytecode_system::{Constant, UopId, UopInstruction, UopKind};

/// Statically known representation of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    /// Nothing known
    #[default]
    Unknown,
    /// Machine int
    Int,
    /// Float
    Float,
    /// String
    Str,
    /// Boolean
    Bool,
}

impl Kind {
    /// Kind of a compile-time constant
    pub fn of_constant(constant: &Constant) -> Kind {
        match constant {
            Constant::Int(_) => Kind::Int,
            Constant::Float(_) => Kind::Float,
            Constant::Str(_) => Kind::Str,
            Constant::Bool(_) => Kind::Bool,
            _ => Kind::Unknown,
        }
    }
}

/// Everything known about one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fact {
    /// Representation
    pub kind: Kind,
    /// Type version already checked for this object
    pub type_version: Option<u64>,
    /// Local slot the value was loaded from, while that slot is unchanged
    pub source: Option<u32>,
}

impl Fact {
    fn of(kind: Kind) -> Self {
        Fact {
            kind,
            ..Fact::default()
        }
    }
}

/// Facts at one point of the trace
#[derive(Debug, Clone, Default)]
pub struct AbstractFrame {
    stack: Vec<Fact>,
    locals: Vec<Fact>,
    globals_version: Option<u64>,
    builtins_version: Option<u64>,
}

impl AbstractFrame {
    /// Frame with `locals` slots and nothing known
    pub fn new(locals: usize) -> Self {
        Self {
            locals: vec![Fact::default(); locals],
            ..Self::default()
        }
    }

    /// Make sure `n` entries are tracked, inventing unknowns below the
    /// entries the trace itself pushed
    fn ensure(&mut self, n: usize) {
        if self.stack.len() < n {
            let missing = n - self.stack.len();
            self.stack
                .splice(0..0, std::iter::repeat(Fact::default()).take(missing));
        }
    }

    fn pop(&mut self) -> Fact {
        self.ensure(1);
        self.stack.pop().unwrap_or_default()
    }

    fn push(&mut self, fact: Fact) {
        self.stack.push(fact);
    }

    fn top_mut(&mut self, n: usize) -> &mut Fact {
        self.ensure(n + 1);
        let index = self.stack.len() - 1 - n;
        &mut self.stack[index]
    }

    fn local(&self, index: u32) -> Fact {
        let mut fact = self.locals.get(index as usize).copied().unwrap_or_default();
        fact.source = Some(index);
        fact
    }

    fn store_local(&mut self, index: u32, mut fact: Fact) {
        fact.source = None;
        if let Some(slot) = self.locals.get_mut(index as usize) {
            *slot = fact;
        }
        for entry in &mut self.stack {
            if entry.source == Some(index) {
                entry.source = None;
            }
        }
    }

    /// Record `version` as checked on the stack entry `n` below TOS
    fn set_type_version(&mut self, n: usize, version: u64) {
        let entry = self.top_mut(n);
        entry.type_version = Some(version);
        if let Some(source) = entry.source {
            if let Some(local) = self.locals.get_mut(source as usize) {
                local.type_version = Some(version);
            }
        }
    }

    fn set_kind(&mut self, n: usize, kind: Kind) {
        let entry = self.top_mut(n);
        entry.kind = kind;
        if let Some(source) = entry.source {
            if let Some(local) = self.locals.get_mut(source as usize) {
                local.kind = kind;
            }
        }
    }

    /// Forget everything code outside the trace could have changed
    fn escape(&mut self) {
        self.globals_version = None;
        self.builtins_version = None;
        for fact in self.stack.iter_mut().chain(self.locals.iter_mut()) {
            fact.type_version = None;
        }
    }

    fn generic(&mut self, uop: &UopInstruction) {
        let inputs = uop.id.stack_inputs(uop.oparg) as usize;
        let outputs = uop.id.stack_outputs(uop.oparg) as usize;
        self.ensure(inputs);
        let keep = self.stack.len() - inputs;
        self.stack.truncate(keep);
        for _ in 0..outputs {
            self.push(Fact::default());
        }
    }

    /// Whether the guard `uop` is implied by the current facts
    fn implies(&mut self, uop: &UopInstruction) -> bool {
        match uop.id {
            UopId::GuardBothInt => self.both(Kind::Int),
            UopId::GuardBothFloat => self.both(Kind::Float),
            UopId::GuardBothUnicode => self.both(Kind::Str),
            UopId::GuardTypeVersion => self.top_mut(0).type_version == Some(uop.operand),
            UopId::GuardGlobalsVersion => self.globals_version == Some(uop.operand),
            UopId::GuardBuiltinsVersion => self.builtins_version == Some(uop.operand),
            _ => false,
        }
    }

    fn both(&mut self, kind: Kind) -> bool {
        self.top_mut(0).kind == kind && self.top_mut(1).kind == kind
    }

    /// Apply the effect of a guard that stays in the trace
    fn assume(&mut self, uop: &UopInstruction) {
        match uop.id {
            UopId::GuardBothInt => self.assume_both(Kind::Int),
            UopId::GuardBothFloat => self.assume_both(Kind::Float),
            UopId::GuardBothUnicode => self.assume_both(Kind::Str),
            UopId::GuardTypeVersion => self.set_type_version(0, uop.operand),
            UopId::GuardGlobalsVersion => self.globals_version = Some(uop.operand),
            UopId::GuardBuiltinsVersion => self.builtins_version = Some(uop.operand),
            _ => {
                let inputs = uop.id.stack_inputs(uop.oparg);
                let popped = inputs.saturating_sub(uop.id.stack_outputs(uop.oparg));
                for _ in 0..popped {
                    self.pop();
                }
            }
        }
    }

    fn assume_both(&mut self, kind: Kind) {
        self.set_kind(0, kind);
        self.set_kind(1, kind);
    }

    /// Apply the effect of a non-guard uop
    fn apply(&mut self, uop: &UopInstruction, constants: &[Constant]) {
        match uop.id {
            UopId::Nop | UopId::CheckValidity | UopId::JumpToTop | UopId::ExitTrace => {}
            UopId::LoadFast => {
                let fact = self.local(uop.oparg);
                self.push(fact);
            }
            UopId::StoreFast => {
                let fact = self.pop();
                self.store_local(uop.oparg, fact);
            }
            UopId::LoadConst => {
                let kind = constants
                    .get(uop.oparg as usize)
                    .map_or(Kind::Unknown, Kind::of_constant);
                self.push(Fact::of(kind));
            }
            UopId::Copy => {
                let depth = uop.oparg.max(1) as usize;
                let mut fact = *self.top_mut(depth - 1);
                fact.source = None;
                self.push(fact);
            }
            UopId::Swap => {
                let depth = uop.oparg.max(1) as usize;
                self.ensure(depth);
                let len = self.stack.len();
                self.stack.swap(len - 1, len - depth);
            }
            UopId::BinaryOpAddInt | UopId::BinaryOpSubtractInt | UopId::BinaryOpMultiplyInt => {
                self.binary(Kind::Int)
            }
            UopId::BinaryOpAddFloat
            | UopId::BinaryOpSubtractFloat
            | UopId::BinaryOpMultiplyFloat => self.binary(Kind::Float),
            UopId::BinaryOpAddUnicode => self.binary(Kind::Str),
            UopId::CompareOpInt | UopId::CompareOpFloat | UopId::CompareOpStr => {
                self.binary(Kind::Bool)
            }
            UopId::UnaryNot => {
                self.pop();
                self.push(Fact::of(Kind::Bool));
            }
            UopId::IterNextRange => {
                self.ensure(1);
                self.push(Fact::of(Kind::Int));
            }
            _ if uop.id.kind() == UopKind::Escape => {
                self.generic(uop);
                self.escape();
            }
            _ => self.generic(uop),
        }
    }

    fn binary(&mut self, result: Kind) {
        self.pop();
        self.pop();
        self.push(Fact::of(result));
    }
}

/// Replace guards implied by earlier uops with `_NOP`
///
/// `constants` are the code unit's constants, `locals` its slot count.
/// Returns the number of guards removed.
pub fn eliminate_guards(uops: &mut [UopInstruction], constants: &[Constant], locals: usize) -> usize {
    let mut frame = AbstractFrame::new(locals);
    let mut removed = 0;
    for uop in uops.iter_mut() {
        if uop.id.kind() == UopKind::Guard {
            if frame.implies(uop) {
                *uop = UopInstruction::new(UopId::Nop, 0, uop.target);
                removed += 1;
            } else {
                frame.assume(uop);
            }
        } else {
            frame.apply(uop, constants);
        }
    }
    removed
}
