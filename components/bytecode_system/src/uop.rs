//! Micro-operations executed by tier-2 executors
//!
//! A uop is finer-grained than a bytecode instruction: one specialized
//! instruction typically becomes a guard followed by a primitive effect.
//! Every uop carries the bytecode offset of the instruction it was recorded
//! from, which is where a failing guard resumes tier-1 execution.

/// How a uop interacts with the facts the optimizer tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UopKind {
    /// Trace control (validity checks, loop closing, exits)
    Control,
    /// Checks a property and side-exits without effects if it fails
    Guard,
    /// Stack/local effect with no externally visible side effects
    Effect,
    /// May run arbitrary code or bump version tags
    Escape,
    /// Superinstruction produced by fusion
    Fused,
}

macro_rules! define_uops {
    ($( $(#[$meta:meta])* $variant:ident => $name:literal, $kind:ident; )*) => {
        /// Micro-operation identifiers
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum UopId {
            $( $(#[$meta])* $variant, )*
        }

        impl UopId {
            /// Every defined uop
            pub const ALL: &'static [UopId] = &[$( UopId::$variant, )*];

            /// Canonical mnemonic
            pub fn name(self) -> &'static str {
                match self {
                    $( UopId::$variant => $name, )*
                }
            }

            /// Optimizer classification
            pub fn kind(self) -> UopKind {
                match self {
                    $( UopId::$variant => UopKind::$kind, )*
                }
            }
        }
    };
}

define_uops! {
    /// No operation; left behind by optimizer passes
    Nop => "_NOP", Control;
    /// Side-exit if any dependency of the executor changed
    CheckValidity => "_CHECK_VALIDITY", Control;
    /// Close the loop
    JumpToTop => "_JUMP_TO_TOP", Control;
    /// Unconditional exit to `target`
    ExitTrace => "_EXIT_TRACE", Control;

    /// Both top items are ints
    GuardBothInt => "_GUARD_BOTH_INT", Guard;
    /// Both top items are floats
    GuardBothFloat => "_GUARD_BOTH_FLOAT", Guard;
    /// Both top items are strings
    GuardBothUnicode => "_GUARD_BOTH_UNICODE", Guard;
    /// TOS is an instance (or type) whose type version equals `operand`
    GuardTypeVersion => "_GUARD_TYPE_VERSION", Guard;
    /// Module namespace keys version equals `operand`
    GuardGlobalsVersion => "_GUARD_GLOBALS_VERSION", Guard;
    /// Builtins namespace keys version equals `operand`
    GuardBuiltinsVersion => "_GUARD_BUILTINS_VERSION", Guard;
    /// Range iterator at TOS has another item
    GuardNotExhaustedRange => "_GUARD_NOT_EXHAUSTED_RANGE", Guard;
    /// List iterator at TOS has another item
    GuardNotExhaustedList => "_GUARD_NOT_EXHAUSTED_LIST", Guard;
    /// TOS is truthy; popped on success
    GuardIsTruePop => "_GUARD_IS_TRUE_POP", Guard;
    /// TOS is falsey; popped on success
    GuardIsFalsePop => "_GUARD_IS_FALSE_POP", Guard;
    /// Callee below `oparg` args is the function with version `operand`
    CheckFunctionExactArgs => "_CHECK_FUNCTION_EXACT_ARGS", Guard;

    /// Push local slot
    LoadFast => "_LOAD_FAST", Effect;
    /// Pop into local slot
    StoreFast => "_STORE_FAST", Effect;
    /// Push code-unit constant
    LoadConst => "_LOAD_CONST", Effect;
    /// Push executor constant produced by folding
    LoadConstInline => "_LOAD_CONST_INLINE", Effect;
    /// Discard TOS
    PopTop => "_POP_TOP", Effect;
    /// Duplicate the n-th item
    Copy => "_COPY", Effect;
    /// Swap TOS with the n-th item
    Swap => "_SWAP", Effect;
    /// Push cell contents
    LoadDeref => "_LOAD_DEREF", Effect;
    /// Pop into cell
    StoreDeref => "_STORE_DEREF", Escape;
    /// Checked `int + int`; exits on overflow
    BinaryOpAddInt => "_BINARY_OP_ADD_INT", Effect;
    /// Checked `int - int`; exits on overflow
    BinaryOpSubtractInt => "_BINARY_OP_SUBTRACT_INT", Effect;
    /// Checked `int * int`; exits on overflow
    BinaryOpMultiplyInt => "_BINARY_OP_MULTIPLY_INT", Effect;
    /// `float + float`
    BinaryOpAddFloat => "_BINARY_OP_ADD_FLOAT", Effect;
    /// `float - float`
    BinaryOpSubtractFloat => "_BINARY_OP_SUBTRACT_FLOAT", Effect;
    /// `float * float`
    BinaryOpMultiplyFloat => "_BINARY_OP_MULTIPLY_FLOAT", Effect;
    /// `str + str`
    BinaryOpAddUnicode => "_BINARY_OP_ADD_UNICODE", Effect;
    /// Generic binary operator
    BinaryOp => "_BINARY_OP", Effect;
    /// Int comparison
    CompareOpInt => "_COMPARE_OP_INT", Effect;
    /// Float comparison
    CompareOpFloat => "_COMPARE_OP_FLOAT", Effect;
    /// String comparison
    CompareOpStr => "_COMPARE_OP_STR", Effect;
    /// Generic comparison
    CompareOp => "_COMPARE_OP", Effect;
    /// `not TOS`
    UnaryNot => "_UNARY_NOT", Effect;
    /// `-TOS`
    UnaryNegative => "_UNARY_NEGATIVE", Effect;
    /// Build tuple
    BuildTuple => "_BUILD_TUPLE", Effect;
    /// Build list
    BuildList => "_BUILD_LIST", Effect;
    /// Subscript
    BinarySubscr => "_BINARY_SUBSCR", Effect;
    /// Read instance layout slot `oparg`
    LoadAttrInstanceValue => "_LOAD_ATTR_INSTANCE_VALUE", Effect;
    /// Read class attribute `co_names[oparg]` from the type at TOS
    LoadAttrClass => "_LOAD_ATTR_CLASS", Effect;
    /// Generic attribute read
    LoadAttr => "_LOAD_ATTR", Effect;
    /// Write instance layout slot `oparg`
    StoreAttrInstanceValue => "_STORE_ATTR_INSTANCE_VALUE", Effect;
    /// Generic attribute write
    StoreAttr => "_STORE_ATTR", Escape;
    /// Read module namespace entry `oparg`
    LoadGlobalModule => "_LOAD_GLOBAL_MODULE", Effect;
    /// Read builtins namespace entry `oparg`
    LoadGlobalBuiltin => "_LOAD_GLOBAL_BUILTIN", Effect;
    /// Generic global read
    LoadGlobal => "_LOAD_GLOBAL", Effect;
    /// Global write
    StoreGlobal => "_STORE_GLOBAL", Escape;
    /// Push the next range item
    IterNextRange => "_ITER_NEXT_RANGE", Effect;
    /// Push the next list item
    IterNextList => "_ITER_NEXT_LIST", Effect;
    /// Opaque call with `oparg` positional arguments
    Call => "_CALL", Escape;

    /// Fused guard and checked int add
    GuardBothIntBinaryOpAddInt => "_GUARD_BOTH_INT__BINARY_OP_ADD_INT", Fused;
    /// Fused guard and checked int subtract
    GuardBothIntBinaryOpSubtractInt => "_GUARD_BOTH_INT__BINARY_OP_SUBTRACT_INT", Fused;
    /// Fused guard and checked int multiply
    GuardBothIntBinaryOpMultiplyInt => "_GUARD_BOTH_INT__BINARY_OP_MULTIPLY_INT", Fused;
    /// Fused guard and float add
    GuardBothFloatBinaryOpAddFloat => "_GUARD_BOTH_FLOAT__BINARY_OP_ADD_FLOAT", Fused;
    /// Fused guard and float subtract
    GuardBothFloatBinaryOpSubtractFloat => "_GUARD_BOTH_FLOAT__BINARY_OP_SUBTRACT_FLOAT", Fused;
    /// Fused guard and float multiply
    GuardBothFloatBinaryOpMultiplyFloat => "_GUARD_BOTH_FLOAT__BINARY_OP_MULTIPLY_FLOAT", Fused;
    /// Fused guard and string concatenation
    GuardBothUnicodeBinaryOpAddUnicode => "_GUARD_BOTH_UNICODE__BINARY_OP_ADD_UNICODE", Fused;
    /// Two local loads; oparg packs both slots
    LoadFastLoadFast => "_LOAD_FAST__LOAD_FAST", Fused;
    /// Store then load; oparg packs both slots
    StoreFastLoadFast => "_STORE_FAST__LOAD_FAST", Fused;
    /// Two local loads, int guard and checked add
    LoadFastLoadFastGuardBothIntBinaryOpAddInt => "_LOAD_FAST__LOAD_FAST__GUARD_BOTH_INT__BINARY_OP_ADD_INT", Fused;
}

impl UopId {
    /// Whether the uop may leave the trace through its side exit
    pub fn can_exit(self) -> bool {
        use UopId::*;
        match self.kind() {
            UopKind::Guard | UopKind::Fused => true,
            UopKind::Control => matches!(self, CheckValidity | ExitTrace),
            _ => matches!(
                self,
                LoadFast
                    | LoadDeref
                    | BinaryOpAddInt
                    | BinaryOpSubtractInt
                    | BinaryOpMultiplyInt
                    | BinaryOpAddFloat
                    | BinaryOpSubtractFloat
                    | BinaryOpMultiplyFloat
                    | BinaryOpAddUnicode
                    | CompareOpInt
                    | CompareOpFloat
                    | CompareOpStr
                    | LoadAttrInstanceValue
                    | LoadAttrClass
                    | LoadGlobalModule
                    | LoadGlobalBuiltin
                    | StoreAttrInstanceValue
            ),
        }
    }

    /// Whether the uop may raise a guest exception
    pub fn can_raise(self) -> bool {
        use UopId::*;
        matches!(
            self,
            BinaryOp
                | CompareOp
                | UnaryNegative
                | BinarySubscr
                | LoadAttr
                | StoreAttr
                | LoadGlobal
                | Call
        )
    }

    /// Pure over its inputs, so it can be folded when they are constants
    pub fn is_pure(self) -> bool {
        use UopId::*;
        matches!(
            self,
            BinaryOpAddInt
                | BinaryOpSubtractInt
                | BinaryOpMultiplyInt
                | BinaryOpAddFloat
                | BinaryOpSubtractFloat
                | BinaryOpMultiplyFloat
                | BinaryOpAddUnicode
                | CompareOpInt
                | CompareOpFloat
                | CompareOpStr
                | UnaryNot
        )
    }

    /// Items popped (or inspected and replaced) from the operand stack
    pub fn stack_inputs(self, oparg: u32) -> u32 {
        use UopId::*;
        match self {
            Nop | CheckValidity | JumpToTop | ExitTrace | GuardGlobalsVersion
            | GuardBuiltinsVersion | LoadFast | LoadConst | LoadConstInline | LoadDeref
            | LoadGlobalModule | LoadGlobalBuiltin | LoadGlobal | LoadFastLoadFast
            | LoadFastLoadFastGuardBothIntBinaryOpAddInt => 0,
            GuardBothInt | GuardBothFloat | GuardBothUnicode => 2,
            GuardTypeVersion | GuardNotExhaustedRange | GuardNotExhaustedList => 1,
            CheckFunctionExactArgs => oparg + 1,
            GuardIsTruePop | GuardIsFalsePop | StoreFast | StoreDeref | PopTop | StoreGlobal
            | UnaryNot | UnaryNegative | LoadAttrInstanceValue | LoadAttrClass | LoadAttr
            | IterNextRange | IterNextList | StoreFastLoadFast => 1,
            Copy | Swap | BuildTuple | BuildList => oparg,
            BinaryOpAddInt | BinaryOpSubtractInt | BinaryOpMultiplyInt | BinaryOpAddFloat
            | BinaryOpSubtractFloat | BinaryOpMultiplyFloat | BinaryOpAddUnicode | BinaryOp
            | CompareOpInt | CompareOpFloat | CompareOpStr | CompareOp | BinarySubscr
            | StoreAttrInstanceValue | StoreAttr | GuardBothIntBinaryOpAddInt
            | GuardBothIntBinaryOpSubtractInt | GuardBothIntBinaryOpMultiplyInt
            | GuardBothFloatBinaryOpAddFloat | GuardBothFloatBinaryOpSubtractFloat
            | GuardBothFloatBinaryOpMultiplyFloat | GuardBothUnicodeBinaryOpAddUnicode => 2,
            Call => oparg + 1,
        }
    }

    /// Items pushed after the inputs are consumed
    pub fn stack_outputs(self, oparg: u32) -> u32 {
        use UopId::*;
        match self {
            Nop | CheckValidity | JumpToTop | ExitTrace | GuardGlobalsVersion
            | GuardBuiltinsVersion | GuardIsTruePop | GuardIsFalsePop | StoreFast | StoreDeref
            | PopTop | StoreGlobal | StoreAttrInstanceValue | StoreAttr => 0,
            GuardBothInt | GuardBothFloat | GuardBothUnicode => 2,
            GuardTypeVersion | GuardNotExhaustedRange | GuardNotExhaustedList => 1,
            CheckFunctionExactArgs => oparg + 1,
            LoadFast | LoadConst | LoadConstInline | LoadDeref | LoadGlobalModule
            | LoadGlobalBuiltin | LoadGlobal | UnaryNot | UnaryNegative | LoadAttrInstanceValue
            | LoadAttrClass | LoadAttr | BuildTuple | BuildList | BinaryOpAddInt
            | BinaryOpSubtractInt | BinaryOpMultiplyInt | BinaryOpAddFloat
            | BinaryOpSubtractFloat | BinaryOpMultiplyFloat | BinaryOpAddUnicode | BinaryOp
            | CompareOpInt | CompareOpFloat | CompareOpStr | CompareOp | BinarySubscr | Call
            | StoreFastLoadFast | GuardBothIntBinaryOpAddInt | GuardBothIntBinaryOpSubtractInt
            | GuardBothIntBinaryOpMultiplyInt | GuardBothFloatBinaryOpAddFloat
            | GuardBothFloatBinaryOpSubtractFloat | GuardBothFloatBinaryOpMultiplyFloat
            | GuardBothUnicodeBinaryOpAddUnicode | LoadFastLoadFastGuardBothIntBinaryOpAddInt => 1,
            Copy => oparg + 1,
            Swap => oparg,
            IterNextRange | IterNextList | LoadFastLoadFast => 2,
        }
    }
}

impl std::fmt::Display for UopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pack two 16-bit slot indices into one fused operand
pub fn pack_pair(first: u32, second: u32) -> Option<u32> {
    if first > 0xffff || second > 0xffff {
        return None;
    }
    Some((first << 16) | second)
}

/// Inverse of [`pack_pair`]
pub fn unpack_pair(packed: u32) -> (u32, u32) {
    (packed >> 16, packed & 0xffff)
}

/// One micro-operation in a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UopInstruction {
    /// Operation id
    pub id: UopId,
    /// Immediate operand
    pub oparg: u32,
    /// Cached operand (version, packed targets, ...)
    pub operand: u64,
    /// Instruction index tier-1 resumes at if this uop exits
    pub target: u32,
}

impl UopInstruction {
    /// Create a uop with no cached operand
    pub fn new(id: UopId, oparg: u32, target: u32) -> Self {
        Self {
            id,
            oparg,
            operand: 0,
            target,
        }
    }

    /// Create a uop carrying a cached operand
    pub fn with_operand(id: UopId, oparg: u32, operand: u64, target: u32) -> Self {
        Self {
            id,
            oparg,
            operand,
            target,
        }
    }
}

impl std::fmt::Display for UopInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.id, self.oparg)?;
        if self.operand != 0 {
            write!(f, " [{:#x}]", self.operand)?;
        }
        write!(f, " -> @{}", self.target)
    }
}
