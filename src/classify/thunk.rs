//! Position-independent-code thunks:
//!
//! ```text
//! thunk:
//!     mov ebx, [esp]
//!     ret
//! ```
//!
//! Calling one leaves the address after the call in a register.

use log::debug;

use super::Classifier;
use crate::expr::Expr;
use crate::{Operation, MAX_INSTRUCTION_SIZE};

impl Classifier<'_> {
    /// True if the current instruction's target is a thunk.
    pub fn is_thunk(&self) -> bool {
        let Some(addr) = self.current().target() else {
            return false;
        };
        let space = self.ctx.space;
        if !space.is_valid_address(addr) {
            debug!("call to 0x{:x} is invalid (outside code or data)", addr);
            return false;
        }
        let Some(bytes) = space.instruction_bytes(addr) else {
            return false;
        };
        let window = &bytes[..bytes.len().min(2 * MAX_INSTRUCTION_SIZE)];

        let decoder = self.ctx.decoder;
        let Some(first) = decoder.decode(window, addr) else {
            return false;
        };
        let Some(second) = window
            .get(first.size as usize..)
            .and_then(|rest| decoder.decode(rest, first.end()))
        else {
            return false;
        };

        if first.operation != Operation::Mov || !second.is_return() {
            return false;
        }
        if !first.reads(&self.ctx.regs.stack_pointer()) {
            return false;
        }
        // Reading the stack pointer is not enough; it must be a zero-offset load.
        matches!(
            first.operand(1).map(|op| &op.expr),
            Some(source @ Expr::Deref { .. }) if source.displacement() == 0
        )
    }
}
