//! Stack-pointer effect simulation over straight-line code.
//!
//! Used to decide whether a callee consumes its return address the normal
//! way. Only instructions that write the stack pointer move the accumulator.

use log::{debug, warn};

use crate::arch::RegisterMap;
use crate::cursor::InsnCursor;
use crate::expr::Expr;
use crate::{Category, Insn, Operation};

/// Stack slots touched by `pusha`/`popa`, in address-width units.
pub const ALL_REGISTER_SLOTS: i64 = 8;

/// Bytes moved by `pushf`/`popf`.
pub const FLAGS_SLOT_BYTES: i64 = 4;

/// Classification of an instruction's effect on the stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpEffect {
    /// Instruction does not write the stack pointer.
    None,
    /// Stack pointer moves by a known signed number of bytes.
    Adjust(i64),
    /// `add sp, x` where `x` does not evaluate.
    UnresolvedAdd,
    /// `sub sp, x` where `x` does not evaluate.
    UnresolvedSub,
    /// Prologue or alignment pattern the simulator does not model
    /// (`enter`, `and sp, mask`).
    Unhandled,
    /// `leave`: restores the stack pointer from the frame pointer.
    Leave,
    /// Writes the stack pointer by an amount we cannot tell.
    Unknown,
}

impl SpEffect {
    /// Classify `insn` under the register roles in `regs`.
    pub fn of(insn: &Insn, regs: &RegisterMap) -> Self {
        let sp = regs.stack_pointer();
        if !insn.writes(&sp) {
            return SpEffect::None;
        }
        let width = regs.address_width() as i64;
        let sp_is_destination = matches!(
            insn.operand(0).map(|op| &op.expr),
            Some(Expr::Reg(reg)) if reg.aliases(&sp)
        );

        match insn.operation {
            Operation::Push => SpEffect::Adjust(-slot_size(insn, width)),
            Operation::Pop => SpEffect::Adjust(slot_size(insn, width)),
            Operation::Pusha => SpEffect::Adjust(-ALL_REGISTER_SLOTS * width),
            Operation::Popa => SpEffect::Adjust(ALL_REGISTER_SLOTS * width),
            Operation::Pushf => SpEffect::Adjust(-FLAGS_SLOT_BYTES),
            Operation::Popf => SpEffect::Adjust(FLAGS_SLOT_BYTES),
            Operation::Add | Operation::Sub if sp_is_destination => {
                let amount = insn.operand(1).and_then(|op| op.expr.eval());
                match (insn.operation, amount) {
                    (Operation::Add, Some(v)) => SpEffect::Adjust(v.to_i64()),
                    (_, Some(v)) => SpEffect::Adjust(v.to_i64().wrapping_neg()),
                    (Operation::Add, None) => SpEffect::UnresolvedAdd,
                    (_, None) => SpEffect::UnresolvedSub,
                }
            }
            Operation::Enter => SpEffect::Unhandled,
            Operation::And => SpEffect::Unhandled,
            Operation::Leave => SpEffect::Leave,
            _ => SpEffect::Unknown,
        }
    }
}

/// Bytes pushed or popped by a push/pop, from its operand size.
fn slot_size(insn: &Insn, width: i64) -> i64 {
    match insn.operand(0).map(|op| op.size) {
        Some(size) if size > 0 => size as i64,
        _ => width,
    }
}

/// Why a simulation stopped before reaching a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Pattern we cannot classify; the caller should assume a genuine call.
    Aborted,
    /// The return address was clobbered in a way we cannot measure.
    Tampered,
}

/// Running stack-pointer accumulator.
#[derive(Debug, Clone)]
pub struct StackSim<'r> {
    regs: &'r RegisterMap,
    delta: i64,
    tampers: bool,
}

impl<'r> StackSim<'r> {
    pub fn new(regs: &'r RegisterMap) -> Self {
        Self {
            regs,
            delta: 0,
            tampers: false,
        }
    }

    /// Net displacement so far, in bytes. Positive means the stack shrank.
    pub fn delta(&self) -> i64 {
        self.delta
    }

    /// True once the delta has been positive at any point.
    pub fn tampers(&self) -> bool {
        self.tampers
    }

    /// Apply one instruction.
    pub fn step(&mut self, insn: &Insn) -> Result<(), Halt> {
        match SpEffect::of(insn, self.regs) {
            SpEffect::None => {}
            SpEffect::Adjust(bytes) => {
                if matches!(insn.operation, Operation::Popa | Operation::Popf) {
                    warn!("{} at 0x{:x} moves the stack pointer by {}", insn.mnemonic, insn.addr, bytes);
                }
                self.delta = self.delta.wrapping_add(bytes);
            }
            SpEffect::UnresolvedAdd => {
                warn!(
                    "add at 0x{:x} modifies the stack pointer but its operand does not evaluate",
                    insn.addr
                );
                return Err(Halt::Tampered);
            }
            SpEffect::UnresolvedSub => {
                debug!("sub at 0x{:x} has an unevaluable operand, stopping", insn.addr);
                return Err(Halt::Aborted);
            }
            SpEffect::Unhandled => {
                if insn.operation != Operation::Enter {
                    warn!("{} at 0x{:x} rounds the stack pointer, not simulated", insn.mnemonic, insn.addr);
                }
                return Err(Halt::Aborted);
            }
            SpEffect::Leave => {
                warn!("leave at 0x{:x} is not simulated", insn.addr);
            }
            SpEffect::Unknown => {
                warn!(
                    "{} at 0x{:x} modifies the stack pointer by an unknown amount",
                    insn.mnemonic, insn.addr
                );
            }
        }
        if self.delta > 0 {
            self.tampers = true;
        }
        Ok(())
    }
}

/// What ended a completed walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Return,
    /// A call or branch
    Transfer,
    /// Ran off decodable memory in the region
    EndOfMemory,
}

/// Outcome of [`simulate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackWalk {
    Aborted,
    Tampered,
    Finished {
        delta: i64,
        tampers: bool,
        terminator: Terminator,
    },
}

/// Walk forward from the cursor's current instruction, accumulating the
/// stack delta until a control transfer or the end of decodable memory.
///
/// The cursor is left on the last instruction examined.
pub fn simulate(cursor: &mut InsnCursor<'_>, regs: &RegisterMap) -> StackWalk {
    let mut sim = StackSim::new(regs);
    loop {
        let insn = cursor.current();
        let terminator = match insn.category {
            Category::Return => Some(Terminator::Return),
            Category::Call | Category::Branch => Some(Terminator::Transfer),
            Category::Other => None,
        };
        if let Some(terminator) = terminator {
            return sim.finish(terminator);
        }

        match sim.step(insn) {
            Ok(()) => {}
            Err(Halt::Aborted) => return StackWalk::Aborted,
            Err(Halt::Tampered) => return StackWalk::Tampered,
        }

        if cursor.advance().is_none() {
            return sim.finish(Terminator::EndOfMemory);
        }
    }
}

impl StackSim<'_> {
    fn finish(&self, terminator: Terminator) -> StackWalk {
        StackWalk::Finished {
            delta: self.delta,
            tampers: self.tampers,
            terminator,
        }
    }
}
