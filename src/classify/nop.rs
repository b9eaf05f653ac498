//! No-op recognition, including `lea` forms that change nothing.

use crate::expr::Expr;
use crate::{Insn, Operation};

/// True iff `insn` has no effect on state the CFG recovery cares about.
///
/// Covers the canonical `nop` and `lea` forms that load a register with
/// its own value (`lea esi, [esi]`, `lea esi, [esi + 0]`).
pub fn is_nop_insn(insn: &Insn) -> bool {
    match insn.operation {
        Operation::Nop => true,
        Operation::Lea => lea_is_nop(insn),
        _ => false,
    }
}

fn lea_is_nop(insn: &Insn) -> bool {
    let [written] = insn.regs_written.as_slice() else {
        return false;
    };
    let Some(source) = insn.operand(1).map(|op| &op.expr) else {
        return false;
    };
    if *source == Expr::Reg(*written) {
        return true;
    }
    source.register_plus_zero() == Some(*written)
}
