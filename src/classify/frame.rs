//! Frame set-up and tear-down, returns, and other small predicates.

use log::debug;

use super::Classifier;
use crate::arch::RegisterMap;
use crate::cfg::{Block, Function};
use crate::{Insn, Operation};

/// True for `mov fp, sp` at the address width with no memory access.
pub fn is_frame_setup(insn: &Insn, regs: &RegisterMap) -> bool {
    if insn.operation != Operation::Mov {
        return false;
    }
    if insn.reads_memory() || insn.writes_memory() {
        debug!("discarding insn {} as stack frame preamble, not a reg-reg move", insn);
        return false;
    }
    if !insn.reads(&regs.stack_pointer()) || !insn.writes(&regs.frame_pointer()) {
        return false;
    }
    if insn.operand(0).map(|op| op.size) != Some(regs.address_width()) {
        debug!(
            "discarding insn {} as stack frame preamble, size mismatch for {}-byte addr width",
            insn,
            regs.address_width()
        );
        return false;
    }
    true
}

impl Classifier<'_> {
    /// True if the function starting here saves the frame pointer first.
    ///
    /// With entry padding the save may come after that many leading
    /// instructions; only the first push counts.
    pub fn saves_frame_pointer(&mut self) -> bool {
        let regs = self.ctx.regs;
        let candidates = self.cursor.current_and_ahead(regs.entry_padding());
        match candidates.iter().find(|insn| insn.operation == Operation::Push) {
            Some(push) => push.reads(&regs.frame_pointer()),
            None => false,
        }
    }

    /// True for a `push fp; mov fp, sp` preamble, allowing entry padding.
    pub fn is_stack_frame_preamble(&mut self) -> bool {
        if !self.saves_frame_pointer() {
            return false;
        }
        let regs = self.ctx.regs;
        self.cursor
            .ahead(regs.preamble_window())
            .iter()
            .any(|insn| is_frame_setup(insn, regs))
    }

    /// True for a return that also pops its arguments (`ret imm16`).
    pub fn cleans_stack(&self) -> bool {
        let insn = self.current();
        insn.is_return() && !insn.operands.is_empty()
    }

    /// True if the current instruction returns from `function`.
    ///
    /// x86 returns are unambiguous, so the function and block are not
    /// consulted.
    pub fn is_return(&self, _function: &Function, _block: &Block) -> bool {
        self.current().is_return()
    }

    /// True for a branch to the very next instruction.
    pub fn is_nop_jump(&self) -> bool {
        let insn = self.current();
        insn.is_branch() && insn.target() == Some(insn.end())
    }

    /// x86 has no linker stubs.
    pub fn is_linker_stub(&self) -> bool {
        false
    }
}
