//! Calls that never return through their pushed return address.

use log::warn;

use super::Classifier;
use crate::stack::{simulate, StackWalk, Terminator};

/// Upper bound on call/branch hops followed from a call target.
pub const MAX_CHAIN_HOPS: usize = 64;

impl Classifier<'_> {
    /// True if the current call never gets its return address consumed by
    /// a matching return, i.e. the call only redirects control flow.
    ///
    /// The callee is followed through chains of direct calls and branches
    /// to its first straight-line code, which is then simulated until the
    /// next control transfer.
    ///
    /// # Panics
    /// Only meaningful for binaries parsed in defensive mode; calling it in
    /// any other mode is a driver bug.
    pub fn is_fake_call(&self) -> bool {
        assert!(
            self.ctx.mode.is_defensive(),
            "fake call detection requires defensive mode"
        );

        let insn = self.current();
        if insn.is_dynamic() {
            return false;
        }
        let Some(entry) = insn.target() else {
            return false;
        };

        let region = self.ctx.region;
        let space = self.ctx.space;
        if !region.contains(entry) {
            return false;
        }
        if !space.is_code(entry) {
            warn!("found function call at 0x{:x} to invalid address 0x{:x}", insn.addr, entry);
            return false;
        }

        let Some(mut cursor) = self.ctx.cursor_at(entry) else {
            return false;
        };

        let mut hops = 0;
        while cursor.current().is_call() || cursor.current().is_branch() {
            let next = match cursor.current().target() {
                Some(next) if region.contains(next) && space.is_code(next) => next,
                other => {
                    warn!(
                        "found call to function at 0x{:x} that leaves to {}, out of the code region",
                        insn.addr,
                        other.map_or_else(|| "an unknown address".to_string(), |a| format!("0x{:x}", a))
                    );
                    return false;
                }
            };
            hops += 1;
            if hops > MAX_CHAIN_HOPS {
                warn!("call at 0x{:x} chains through more than {} transfers", insn.addr, MAX_CHAIN_HOPS);
                return false;
            }
            if !cursor.retarget(next) {
                return false;
            }
        }

        match simulate(&mut cursor, self.ctx.regs) {
            StackWalk::Aborted => false,
            StackWalk::Tampered => true,
            StackWalk::Finished {
                terminator: Terminator::Return,
                ..
            } => false,
            StackWalk::Finished { delta, tampers, .. } => {
                let fake = delta > 0 || tampers;
                if fake {
                    warn!("call at 0x{:x} to 0x{:x} discards its return address", insn.addr, entry);
                }
                fake
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::cfg::{Block, Cfg};
    use crate::classify::{Classifier, ParseContext};
    use crate::config::Mode;
    use crate::fixtures::{self, ScriptedDecoder};
    use crate::space::{CodeRegion, MappedImage, Section};
    use crate::{Architecture, Insn, Register, RegisterMap};

    fn classify(insns: Vec<Insn>, image: &MappedImage, mode: Mode) -> bool {
        let decoder = ScriptedDecoder::new(insns);
        let cfg = Cfg::new();
        let regs = RegisterMap::for_architecture(Architecture::X86_32).unwrap();
        let ctx = ParseContext::new(&decoder, image, &cfg, CodeRegion::new(0x1000, 0x1100), &regs, mode);
        let site = Classifier::at(ctx, 0x1000, Block::new(0x1000, 0x1005)).unwrap();
        site.is_fake_call()
    }

    fn chain(hops: usize, body: Vec<Insn>) -> Vec<Insn> {
        let mut insns = vec![fixtures::call(0x1000, 0x1010)];
        for i in 0..hops {
            let at = 0x1010 + 0x10 * i as u64;
            insns.push(fixtures::jmp(at, at + 0x10));
        }
        let body_start = 0x1010 + 0x10 * hops as u64;
        let mut addr = body_start;
        for insn in body {
            let size = insn.size;
            insns.push(fixtures::relocate(insn, addr));
            addr += size as u64;
        }
        insns
    }

    #[rstest]
    fn test_chain_ending_in_return_is_genuine(#[values(0, 1, 2, 3, 4, 5)] hops: usize) {
        let image = fixtures::image(0x1000, 0x100);
        let bodies = [
            vec![fixtures::ret(0)],
            vec![fixtures::push(0, Register::EBP), fixtures::pop(0, Register::EBP), fixtures::ret(0)],
            vec![fixtures::pop(0, Register::EAX), fixtures::ret(0)],
        ];
        for body in bodies {
            assert!(!classify(chain(hops, body), &image, Mode::Defensive));
        }
    }

    #[test]
    fn test_pop_then_jump_is_fake() {
        let image = fixtures::image(0x1000, 0x100);
        let insns = chain(1, vec![fixtures::pop(0, Register::EAX), fixtures::jmp(0, 0x1080)]);
        assert!(classify(insns, &image, Mode::Defensive));
    }

    #[test]
    fn test_balanced_block_then_jump_is_genuine() {
        let image = fixtures::image(0x1000, 0x100);
        let insns = chain(0, vec![fixtures::push(0, Register::EBP), fixtures::pop(0, Register::EBP), fixtures::jmp(0, 0x1080)]);
        assert!(!classify(insns, &image, Mode::Defensive));
    }

    #[test]
    fn test_tampering_is_sticky() {
        let image = fixtures::image(0x1000, 0x100);
        let insns = chain(
            0,
            vec![
                fixtures::pop(0, Register::EAX),
                fixtures::sub_sp(0, 0x10, 1),
                fixtures::jmp(0, 0x1080),
            ],
        );
        assert!(classify(insns, &image, Mode::Defensive));
    }

    #[test]
    fn test_unevaluable_add_is_fake_and_sub_is_not() {
        let image = fixtures::image(0x1000, 0x100);
        let add = chain(0, vec![fixtures::add_sp_reg(0, Register::EAX), fixtures::ret(0)]);
        assert!(classify(add, &image, Mode::Defensive));

        let sub = chain(0, vec![fixtures::sub_sp_reg(0, Register::EAX), fixtures::pop(0, Register::EAX), fixtures::jmp(0, 0x1080)]);
        assert!(!classify(sub, &image, Mode::Defensive));
    }

    #[test]
    fn test_enter_and_alignment_abort() {
        let image = fixtures::image(0x1000, 0x100);
        let enter = chain(0, vec![fixtures::bare(0, 4, "enter"), fixtures::pop(0, Register::EAX), fixtures::jmp(0, 0x1080)]);
        assert!(!classify(enter, &image, Mode::Defensive));

        let and = chain(0, vec![fixtures::and_sp(0, -16), fixtures::pop(0, Register::EAX), fixtures::jmp(0, 0x1080)]);
        assert!(!classify(and, &image, Mode::Defensive));
    }

    #[test]
    fn test_invalid_targets() {
        let image = fixtures::image(0x1000, 0x100);
        let insns = vec![fixtures::call(0x1000, 0x2000)];
        assert!(!classify(insns, &image, Mode::Defensive));

        let mut image = MappedImage::new(Architecture::X86_32, 0);
        image.sections.push(Section::new(".text", 0x1000, vec![0x90; 0x80], true));
        image.sections.push(Section::new(".data", 0x1080, vec![0; 0x80], false));
        let into_data = vec![fixtures::call(0x1000, 0x1090)];
        assert!(!classify(into_data, &image, Mode::Defensive));

        let hop_into_data = vec![fixtures::call(0x1000, 0x1010), fixtures::jmp(0x1010, 0x1090)];
        assert!(!classify(hop_into_data, &image, Mode::Defensive));
    }

    #[test]
    fn test_dynamic_call_is_not_fake() {
        let image = fixtures::image(0x1000, 0x100);
        let insns = vec![fixtures::call_reg(0x1000, Register::EAX)];
        let decoder = ScriptedDecoder::new(insns);
        let cfg = Cfg::new();
        let regs = RegisterMap::for_architecture(Architecture::X86_32).unwrap();
        let ctx = ParseContext::new(&decoder, &image, &cfg, CodeRegion::new(0x1000, 0x1100), &regs, Mode::Defensive);
        let site = Classifier::at(ctx, 0x1000, Block::new(0x1000, 0x1002)).unwrap();
        assert!(!site.is_fake_call());
    }

    #[test]
    fn test_self_loop_is_bounded() {
        let image = fixtures::image(0x1000, 0x100);
        let insns = vec![fixtures::call(0x1000, 0x1010), fixtures::jmp(0x1010, 0x1010)];
        assert!(!classify(insns, &image, Mode::Defensive));
    }

    #[test]
    #[should_panic(expected = "defensive mode")]
    fn test_requires_defensive_mode() {
        let image = fixtures::image(0x1000, 0x100);
        classify(chain(0, vec![fixtures::ret(0)]), &image, Mode::Normal);
    }
}
