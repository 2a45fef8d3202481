//! Opcode table for the tiered interpreter
//!
//! An instruction word is an 8-bit opcode followed by an 8-bit operand.
//! Base opcodes are what a compiler emits. Specialized opcodes are only ever
//! written into a live instruction stream by the quickening engine, and each
//! one maps back to exactly one base form.

macro_rules! define_opcodes {
    ($( $(#[$meta:meta])* $variant:ident = $value:literal => $name:literal, )*) => {
        /// Instruction opcodes, base and specialized forms
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $(#[$meta])* $variant = $value, )*
        }

        impl Opcode {
            /// Every defined opcode in numeric order
            pub const ALL: &'static [Opcode] = &[$( Opcode::$variant, )*];

            /// Decode a raw opcode byte
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $( $value => Some(Opcode::$variant), )*
                    _ => None,
                }
            }

            /// Canonical upper-case mnemonic
            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }
        }
    };
}

define_opcodes! {
    /// Do nothing
    Nop = 0 => "NOP",
    /// Discard TOS
    PopTop = 1 => "POP_TOP",
    /// Push a copy of the n-th stack item (1 = TOS)
    Copy = 2 => "COPY",
    /// Swap TOS with the n-th stack item
    Swap = 3 => "SWAP",
    /// Push constant `co_consts[oparg]`
    LoadConst = 4 => "LOAD_CONST",
    /// Return constant `co_consts[oparg]`
    ReturnConst = 5 => "RETURN_CONST",
    /// Return TOS to the caller
    ReturnValue = 6 => "RETURN_VALUE",
    /// Push local slot `oparg`
    LoadFast = 7 => "LOAD_FAST",
    /// Pop TOS into local slot `oparg`
    StoreFast = 8 => "STORE_FAST",
    /// Clear local slot `oparg`
    DeleteFast = 9 => "DELETE_FAST",
    /// Push the contents of the cell in slot `oparg`
    LoadDeref = 10 => "LOAD_DEREF",
    /// Pop TOS into the cell in slot `oparg`
    StoreDeref = 11 => "STORE_DEREF",
    /// Wrap slot `oparg` in a fresh cell
    MakeCell = 12 => "MAKE_CELL",
    /// Push global `co_names[oparg]`, falling back to builtins
    LoadGlobal = 13 => "LOAD_GLOBAL",
    /// Pop TOS into global `co_names[oparg]`
    StoreGlobal = 14 => "STORE_GLOBAL",
    /// Replace TOS with attribute `co_names[oparg]` of TOS
    LoadAttr = 15 => "LOAD_ATTR",
    /// `TOS.name = TOS1`
    StoreAttr = 16 => "STORE_ATTR",
    /// Binary operator selected by oparg (see [`BinaryOperator`])
    BinaryOp = 17 => "BINARY_OP",
    /// Rich comparison selected by oparg (see [`ComparisonOperator`])
    CompareOp = 18 => "COMPARE_OP",
    /// `-TOS`
    UnaryNegative = 19 => "UNARY_NEGATIVE",
    /// `not TOS`
    UnaryNot = 20 => "UNARY_NOT",
    /// Build a tuple from the top `oparg` items
    BuildTuple = 21 => "BUILD_TUPLE",
    /// Build a list from the top `oparg` items
    BuildList = 22 => "BUILD_LIST",
    /// `TOS1[TOS]`
    BinarySubscr = 23 => "BINARY_SUBSCR",
    /// Replace TOS with an iterator over it
    GetIter = 24 => "GET_ITER",
    /// Push the next item of the iterator at TOS, or pop it and jump forward
    ForIter = 25 => "FOR_ITER",
    /// Unconditional forward jump
    JumpForward = 26 => "JUMP_FORWARD",
    /// Unconditional backward jump; hot loops are traced from here
    JumpBackward = 27 => "JUMP_BACKWARD",
    /// Pop TOS and jump forward if it is falsey
    PopJumpIfFalse = 28 => "POP_JUMP_IF_FALSE",
    /// Pop TOS and jump forward if it is truthy
    PopJumpIfTrue = 29 => "POP_JUMP_IF_TRUE",
    /// Call the callable below `oparg` positional arguments
    Call = 30 => "CALL",
    /// Build a function from the code object at TOS (bit 0: closure tuple below it)
    MakeFunction = 31 => "MAKE_FUNCTION",
    /// Suspend a generator frame, yielding TOS
    YieldValue = 32 => "YIELD_VALUE",
    /// Raise the exception (or exception type) at TOS
    RaiseVarargs = 33 => "RAISE_VARARGS",
    /// Re-raise the exception at TOS without extending its traceback origin
    Reraise = 34 => "RERAISE",
    /// Replace the type at TOS with whether the exception at TOS1 matches it
    CheckExcMatch = 35 => "CHECK_EXC_MATCH",
    /// Prefix extending the operand of the following instruction by 8 bits
    ExtendedArg = 36 => "EXTENDED_ARG",
    /// Frame entry / resumption point
    Resume = 37 => "RESUME",
    /// Backward jump with an installed tier-2 executor
    EnterExecutor = 38 => "ENTER_EXECUTOR",

    /// `int + int`
    BinaryOpAddInt = 64 => "BINARY_OP_ADD_INT",
    /// `int - int`
    BinaryOpSubtractInt = 65 => "BINARY_OP_SUBTRACT_INT",
    /// `int * int`
    BinaryOpMultiplyInt = 66 => "BINARY_OP_MULTIPLY_INT",
    /// `float + float`
    BinaryOpAddFloat = 67 => "BINARY_OP_ADD_FLOAT",
    /// `float - float`
    BinaryOpSubtractFloat = 68 => "BINARY_OP_SUBTRACT_FLOAT",
    /// `float * float`
    BinaryOpMultiplyFloat = 69 => "BINARY_OP_MULTIPLY_FLOAT",
    /// `str + str`
    BinaryOpAddUnicode = 70 => "BINARY_OP_ADD_UNICODE",
    /// Comparison of two ints
    CompareOpInt = 71 => "COMPARE_OP_INT",
    /// Comparison of two floats
    CompareOpFloat = 72 => "COMPARE_OP_FLOAT",
    /// Comparison of two strings
    CompareOpStr = 73 => "COMPARE_OP_STR",
    /// Instance attribute read through the cached layout slot
    LoadAttrInstanceValue = 74 => "LOAD_ATTR_INSTANCE_VALUE",
    /// Class attribute read on a type object
    LoadAttrClass = 75 => "LOAD_ATTR_CLASS",
    /// Instance attribute write through the cached layout slot
    StoreAttrInstanceValue = 76 => "STORE_ATTR_INSTANCE_VALUE",
    /// Global read through the cached module namespace entry
    LoadGlobalModule = 77 => "LOAD_GLOBAL_MODULE",
    /// Global read through the cached builtins namespace entry
    LoadGlobalBuiltin = 78 => "LOAD_GLOBAL_BUILTIN",
    /// `FOR_ITER` over a range iterator
    ForIterRange = 79 => "FOR_ITER_RANGE",
    /// `FOR_ITER` over a list iterator
    ForIterList = 80 => "FOR_ITER_LIST",
    /// Call of a plain function with exactly its positional parameter count
    CallPyExactArgs = 81 => "CALL_PY_EXACT_ARGS",
}

impl Opcode {
    /// The base (generic) form of this opcode
    ///
    /// Specialized opcodes deoptimize to this form; base opcodes map to
    /// themselves. `ENTER_EXECUTOR` maps back to `JUMP_BACKWARD`.
    pub fn base(self) -> Opcode {
        use Opcode::*;
        match self {
            BinaryOpAddInt | BinaryOpSubtractInt | BinaryOpMultiplyInt | BinaryOpAddFloat
            | BinaryOpSubtractFloat | BinaryOpMultiplyFloat | BinaryOpAddUnicode => BinaryOp,
            CompareOpInt | CompareOpFloat | CompareOpStr => CompareOp,
            LoadAttrInstanceValue | LoadAttrClass => LoadAttr,
            StoreAttrInstanceValue => StoreAttr,
            LoadGlobalModule | LoadGlobalBuiltin => LoadGlobal,
            ForIterRange | ForIterList => ForIter,
            CallPyExactArgs => Call,
            EnterExecutor => JumpBackward,
            other => other,
        }
    }

    /// Whether this opcode is a specialized form written by quickening
    pub fn is_specialized(self) -> bool {
        (self as u8) >= 64
    }

    /// Whether a compiler may emit this opcode
    pub fn is_compiler_output(self) -> bool {
        !self.is_specialized() && self != Opcode::EnterExecutor
    }

    /// Whether this base opcode has an adaptive counter driving specialization
    pub fn is_adaptive(self) -> bool {
        matches!(
            self,
            Opcode::BinaryOp
                | Opcode::CompareOp
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::LoadGlobal
                | Opcode::ForIter
                | Opcode::Call
        )
    }

    /// Whether this opcode transfers control backwards
    pub fn is_backward_jump(self) -> bool {
        matches!(self, Opcode::JumpBackward | Opcode::EnterExecutor)
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self.base(),
            Opcode::ReturnValue
                | Opcode::ReturnConst
                | Opcode::RaiseVarargs
                | Opcode::Reraise
                | Opcode::JumpForward
                | Opcode::JumpBackward
        )
    }

    /// Jump target of a branching instruction
    ///
    /// `next` is the index of the instruction word following this one.
    /// Returns `None` for non-branching opcodes, or when a backward delta
    /// would underflow the start of the stream.
    pub fn jump_target(self, next: usize, oparg: u32) -> Option<usize> {
        match self.base() {
            Opcode::JumpForward
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::ForIter => Some(next + oparg as usize),
            Opcode::JumpBackward => next.checked_sub(oparg as usize),
            _ => None,
        }
    }

    /// Number of operand stack items this instruction consumes
    pub fn stack_inputs(self, oparg: u32) -> u32 {
        use Opcode::*;
        match self.base() {
            Nop | LoadConst | ReturnConst | LoadFast | DeleteFast | LoadDeref | MakeCell
            | LoadGlobal | JumpForward | JumpBackward | ExtendedArg | Resume => 0,
            PopTop | ReturnValue | StoreFast | StoreDeref | StoreGlobal | LoadAttr
            | UnaryNegative | UnaryNot | GetIter | ForIter | PopJumpIfFalse | PopJumpIfTrue
            | YieldValue | RaiseVarargs | Reraise => 1,
            StoreAttr | BinaryOp | CompareOp | BinarySubscr | CheckExcMatch => 2,
            Copy | Swap | BuildTuple | BuildList => oparg,
            Call => oparg + 1,
            MakeFunction => 1 + (oparg & 1),
            _ => 0,
        }
    }

    /// Number of operand stack items this instruction produces
    ///
    /// `jump` selects the taken-branch effect for conditional instructions.
    pub fn stack_outputs(self, oparg: u32, jump: bool) -> u32 {
        use Opcode::*;
        match self.base() {
            Nop | ReturnConst | ReturnValue | StoreFast | DeleteFast | StoreDeref | MakeCell
            | StoreGlobal | StoreAttr | PopTop | JumpForward | JumpBackward | PopJumpIfFalse
            | PopJumpIfTrue | RaiseVarargs | Reraise | ExtendedArg | Resume => 0,
            LoadConst | LoadFast | LoadDeref | LoadGlobal | LoadAttr | BinaryOp | CompareOp
            | UnaryNegative | UnaryNot | BuildTuple | BuildList | BinarySubscr | GetIter
            | Call | MakeFunction | YieldValue => 1,
            CheckExcMatch => 2,
            ForIter => {
                if jump {
                    0
                } else {
                    2
                }
            }
            Copy => oparg + 1,
            Swap => oparg,
            _ => 0,
        }
    }

    /// Net stack effect
    pub fn stack_effect(self, oparg: u32, jump: bool) -> i64 {
        self.stack_outputs(oparg, jump) as i64 - self.stack_inputs(oparg) as i64
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator selected by the `BINARY_OP` operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    /// `+`
    Add = 0,
    /// `-`
    Subtract = 1,
    /// `*`
    Multiply = 2,
    /// `/`
    TrueDivide = 3,
    /// `//`
    FloorDivide = 4,
    /// `%`
    Remainder = 5,
    /// `**`
    Power = 6,
}

impl BinaryOperator {
    /// Decode a `BINARY_OP` operand
    pub fn from_oparg(oparg: u32) -> Option<Self> {
        Some(match oparg {
            0 => BinaryOperator::Add,
            1 => BinaryOperator::Subtract,
            2 => BinaryOperator::Multiply,
            3 => BinaryOperator::TrueDivide,
            4 => BinaryOperator::FloorDivide,
            5 => BinaryOperator::Remainder,
            6 => BinaryOperator::Power,
            _ => return None,
        })
    }

    /// Source-level symbol
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::TrueDivide => "/",
            BinaryOperator::FloorDivide => "//",
            BinaryOperator::Remainder => "%",
            BinaryOperator::Power => "**",
        }
    }
}

/// Comparison selected by the `COMPARE_OP` operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    /// `<`
    Less = 0,
    /// `<=`
    LessEqual = 1,
    /// `==`
    Equal = 2,
    /// `!=`
    NotEqual = 3,
    /// `>`
    Greater = 4,
    /// `>=`
    GreaterEqual = 5,
}

impl ComparisonOperator {
    /// Decode a `COMPARE_OP` operand
    pub fn from_oparg(oparg: u32) -> Option<Self> {
        Some(match oparg {
            0 => ComparisonOperator::Less,
            1 => ComparisonOperator::LessEqual,
            2 => ComparisonOperator::Equal,
            3 => ComparisonOperator::NotEqual,
            4 => ComparisonOperator::Greater,
            5 => ComparisonOperator::GreaterEqual,
            _ => return None,
        })
    }

    /// Source-level symbol
    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Less => "<",
            ComparisonOperator::LessEqual => "<=",
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::Greater => ">",
            ComparisonOperator::GreaterEqual => ">=",
        }
    }

    /// Apply the comparison to an ordering
    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            ComparisonOperator::Less => ordering == Less,
            ComparisonOperator::LessEqual => ordering != Greater,
            ComparisonOperator::Equal => ordering == Equal,
            ComparisonOperator::NotEqual => ordering != Equal,
            ComparisonOperator::Greater => ordering == Greater,
            ComparisonOperator::GreaterEqual => ordering != Less,
        }
    }
}
