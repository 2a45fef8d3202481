//! Text listing of a live code unit
//!
//! Shows the current (possibly quickened) opcodes so specialization and
//! executor installation can be observed from the outside.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::code::{CodeUnit, Constant};
use crate::opcode::{BinaryOperator, ComparisonOperator, Opcode};

fn argrepr(code: &CodeUnit, opcode: Opcode, oparg: u32, next: usize) -> String {
    let idx = oparg as usize;
    match opcode.base() {
        Opcode::LoadConst | Opcode::ReturnConst => code
            .constants()
            .get(idx)
            .map(|c| c.to_string())
            .unwrap_or_default(),
        Opcode::LoadFast
        | Opcode::StoreFast
        | Opcode::DeleteFast
        | Opcode::LoadDeref
        | Opcode::StoreDeref
        | Opcode::MakeCell => code
            .slots()
            .get(idx)
            .map(|s| s.name.to_string())
            .unwrap_or_default(),
        Opcode::LoadGlobal | Opcode::StoreGlobal | Opcode::LoadAttr | Opcode::StoreAttr => code
            .names()
            .get(idx)
            .map(|n| n.to_string())
            .unwrap_or_default(),
        Opcode::BinaryOp => BinaryOperator::from_oparg(oparg)
            .map(|op| op.symbol().to_string())
            .unwrap_or_default(),
        Opcode::CompareOp => ComparisonOperator::from_oparg(oparg)
            .map(|op| op.symbol().to_string())
            .unwrap_or_default(),
        _ if opcode == Opcode::EnterExecutor => {
            format!("executor {}", code.cache(next - 1).index())
        }
        _ => match opcode.jump_target(next, oparg) {
            Some(target) => format!("to {}", target),
            None => String::new(),
        },
    }
}

/// Render `code` and every nested code constant
pub fn disassemble(code: &CodeUnit) -> String {
    let mut out = String::new();
    render(code, &mut out);
    out
}

fn render(code: &CodeUnit, out: &mut String) {
    let decoded = code.decoded();
    let targets: BTreeSet<usize> = decoded
        .iter()
        .filter_map(|d| d.opcode.jump_target(d.next(), d.oparg))
        .chain(code.exception_table().iter().map(|e| e.target as usize))
        .collect();

    let _ = writeln!(out, "Disassembly of <code {}>:", code.qualname());
    let mut last_line = None;
    for d in &decoded {
        let line = code.line_for(d.index);
        let line_col = match line {
            Some(l) if line != last_line => format!("{:>4}", l),
            _ => "    ".to_string(),
        };
        last_line = line.or(last_line);
        let marker = if targets.contains(&d.start) { ">>" } else { "  " };
        let repr = argrepr(code, d.opcode, d.oparg, d.next());
        let mut row = format!("{} {} {:>4} {:<28} {:>3}", line_col, marker, d.index, d.opcode.name(), d.oparg);
        if !repr.is_empty() {
            let _ = write!(row, " ({})", repr);
        }
        let _ = writeln!(out, "{}", row.trim_end());
    }

    if !code.exception_table().is_empty() {
        let _ = writeln!(out, "ExceptionTable:");
        for entry in code.exception_table() {
            let _ = writeln!(
                out,
                "  {} to {} -> {} [{}]{}",
                entry.start,
                entry.end,
                entry.target,
                entry.depth,
                if entry.lasti { " lasti" } else { "" }
            );
        }
    }

    for constant in code.constants() {
        if let Constant::Code(inner) = constant {
            out.push('\n');
            render(inner, out);
        }
    }
}
