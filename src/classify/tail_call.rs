//! Tail-call detection for jumps that leave the current function.

use std::collections::HashSet;

use log::debug;

use super::Classifier;
use crate::cfg::{Block, EdgeType, Function};
use crate::{Address, Operation};

impl Classifier<'_> {
    /// Decide whether the transfer at the current instruction, taken along
    /// an edge of type `edge`, leaves `function` as a tail call.
    ///
    /// `known_targets` holds addresses already known to be non-entry code
    /// of `function`. Verdicts are cached per branch class for the lifetime
    /// of this classifier.
    pub fn is_tail_call(&mut self, function: &Function, edge: EdgeType, known_targets: &HashSet<Address>) -> bool {
        let Some(kind) = edge.branch_class() else {
            return false;
        };

        debug!("checking 0x{:x} for tail call", self.current().addr);
        if let Some(&verdict) = self.tail_calls.get(&kind) {
            debug!("\treturning cached tail call check result: {}", verdict);
            return verdict;
        }

        let verdict = self.resolve_tail_call(function, known_targets);
        self.tail_calls.insert(kind, verdict);
        verdict
    }

    fn resolve_tail_call(&self, function: &Function, known_targets: &HashSet<Address>) -> bool {
        let cfg = self.ctx.cfg;
        let insn = self.current();
        let is_branch = insn.is_branch();
        let target = insn.target();

        let callee = target.and_then(|addr| cfg.function_by_entry(addr));
        let mut target_block = target.and_then(|addr| cfg.block_by_entry(addr));

        // Not a block entry; maybe a jump into the middle of one.
        if let (None, Some(addr)) = (target_block, target) {
            match cfg.blocks_covering(addr).as_slice() {
                [] => {}
                [block] => target_block = Some(*block),
                blocks => {
                    for block in blocks {
                        debug!("\tblock [0x{:x},0x{:x})", block.start, block.end);
                    }
                    debug!("\tjump to 0x{:x} enters overlapping instruction streams, NOT TAIL CALL", addr);
                    return false;
                }
            }
        }

        if is_branch {
            if let (Some(addr), Some(callee), Some(block)) = (target, callee, target_block) {
                if callee.entry != function.entry && !function.contains(block) {
                    debug!("\tjump to 0x{:x}, TAIL CALL", addr);
                    return true;
                }
            }
        }

        if let (true, Some(addr), None) = (is_branch, target, callee) {
            if target_block.is_some() {
                debug!("\tjump to 0x{:x} is known block, but not func entry, NOT TAIL CALL", addr);
                return false;
            }
            if known_targets.contains(&addr) {
                debug!("\tjump to 0x{:x} is known target in this function, NOT TAIL CALL", addr);
                return false;
            }
        }

        if self.cursor.position() == 0 {
            if function.entry == self.block.start && is_branch {
                debug!("\tjump as only insn in entry block, TAIL CALL");
                return true;
            }
            debug!("\ttoo few insns to detect tail call");
            return false;
        }

        if is_branch {
            if let Some(prev) = self.cursor.previous_non_nop() {
                match prev.operation {
                    Operation::Leave => {
                        debug!("\tprev insn was leave, TAIL CALL");
                        return true;
                    }
                    Operation::Pop if prev.writes(&self.ctx.regs.frame_pointer()) => {
                        debug!("\tprev insn was {}, TAIL CALL", prev);
                        return true;
                    }
                    Operation::Add if prev.writes(&self.ctx.regs.stack_pointer()) => {
                        if prev.addr == self.block.start && self.entered_by_call_return(&self.block) {
                            debug!("\tprev insn was {}, but it follows a call, NOT TAIL CALL", prev);
                        } else {
                            debug!("\tprev insn was {}, TAIL CALL", prev);
                            return true;
                        }
                    }
                    _ => debug!("\tprev insn was {}, not tail call", prev),
                }
            }
        }

        false
    }

    /// True if some call returns into `block`.
    fn entered_by_call_return(&self, block: &Block) -> bool {
        self.ctx
            .cfg
            .sources(block)
            .iter()
            .any(|edge| edge.kind == EdgeType::CallFt)
    }
}
