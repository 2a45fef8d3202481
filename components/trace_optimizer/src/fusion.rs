//! Superinstruction fusion
//!
//! Adjacent uops matching an entry of the pattern table are replaced by one
//! fused uop. Longer patterns are tried first. A fused uop keeps enough
//! information to side-exit exactly where each of its parts would have.

use bytecode_system::{pack_pair, UopId, UopInstruction};

/// One row of the fusion table
#[derive(Debug, Clone, Copy)]
pub struct Pattern {
    /// Uops that must appear consecutively
    pub parts: &'static [UopId],
    /// Replacement
    pub fused: UopId,
}

/// Fusion table, longest patterns first
pub const PATTERNS: &[Pattern] = &[
    Pattern {
        parts: &[
            UopId::LoadFast,
            UopId::LoadFast,
            UopId::GuardBothInt,
            UopId::BinaryOpAddInt,
        ],
        fused: UopId::LoadFastLoadFastGuardBothIntBinaryOpAddInt,
    },
    Pattern {
        parts: &[UopId::GuardBothInt, UopId::BinaryOpAddInt],
        fused: UopId::GuardBothIntBinaryOpAddInt,
    },
    Pattern {
        parts: &[UopId::GuardBothInt, UopId::BinaryOpSubtractInt],
        fused: UopId::GuardBothIntBinaryOpSubtractInt,
    },
    Pattern {
        parts: &[UopId::GuardBothInt, UopId::BinaryOpMultiplyInt],
        fused: UopId::GuardBothIntBinaryOpMultiplyInt,
    },
    Pattern {
        parts: &[UopId::GuardBothFloat, UopId::BinaryOpAddFloat],
        fused: UopId::GuardBothFloatBinaryOpAddFloat,
    },
    Pattern {
        parts: &[UopId::GuardBothFloat, UopId::BinaryOpSubtractFloat],
        fused: UopId::GuardBothFloatBinaryOpSubtractFloat,
    },
    Pattern {
        parts: &[UopId::GuardBothFloat, UopId::BinaryOpMultiplyFloat],
        fused: UopId::GuardBothFloatBinaryOpMultiplyFloat,
    },
    Pattern {
        parts: &[UopId::GuardBothUnicode, UopId::BinaryOpAddUnicode],
        fused: UopId::GuardBothUnicodeBinaryOpAddUnicode,
    },
    Pattern {
        parts: &[UopId::LoadFast, UopId::LoadFast],
        fused: UopId::LoadFastLoadFast,
    },
    Pattern {
        parts: &[UopId::StoreFast, UopId::LoadFast],
        fused: UopId::StoreFastLoadFast,
    },
];

/// Build the fused uop for `parts`, or `None` if the operands do not fit
///
/// Exit targets: a guard+op pair exits at the pair's shared target. Paired
/// loads exit at the second load's target with the first load's target in
/// `operand`. The four-part form exits at the guard's target and packs both
/// load targets into `operand` (first in the high half).
fn combine(fused: UopId, parts: &[UopInstruction]) -> Option<UopInstruction> {
    match parts {
        [first, second, guard, op] => {
            if guard.target != op.target {
                return None;
            }
            let oparg = pack_pair(first.oparg, second.oparg)?;
            let operand = ((first.target as u64) << 32) | second.target as u64;
            Some(UopInstruction::with_operand(fused, oparg, operand, guard.target))
        }
        [first, second] if fused == UopId::LoadFastLoadFast => {
            let oparg = pack_pair(first.oparg, second.oparg)?;
            Some(UopInstruction::with_operand(
                fused,
                oparg,
                first.target as u64,
                second.target,
            ))
        }
        [first, second] if fused == UopId::StoreFastLoadFast => {
            let oparg = pack_pair(first.oparg, second.oparg)?;
            Some(UopInstruction::new(fused, oparg, second.target))
        }
        [guard, op] => {
            if guard.target != op.target {
                return None;
            }
            Some(UopInstruction::new(fused, op.oparg, guard.target))
        }
        _ => None,
    }
}

fn matches(pattern: &Pattern, window: &[UopInstruction]) -> bool {
    window.len() >= pattern.parts.len()
        && pattern
            .parts
            .iter()
            .zip(window)
            .all(|(id, uop)| *id == uop.id)
}

/// Fuse `uops` greedily, longest match first
///
/// Returns the new sequence and the number of fused uops produced.
pub fn fuse(uops: &[UopInstruction]) -> (Vec<UopInstruction>, usize) {
    let mut out = Vec::with_capacity(uops.len());
    let mut fused = 0;
    let mut position = 0;
    'outer: while position < uops.len() {
        let window = &uops[position..];
        for pattern in PATTERNS {
            if !matches(pattern, window) {
                continue;
            }
            let len = pattern.parts.len();
            if let Some(uop) = combine(pattern.fused, &window[..len]) {
                out.push(uop);
                fused += 1;
                position += len;
                continue 'outer;
            }
        }
        out.push(uops[position]);
        position += 1;
    }
    (out, fused)
}
