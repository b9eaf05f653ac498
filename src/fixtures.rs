//! Hand-built x86-32 instructions and collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cfg::{Block, Cfg, CfgStore, Edge, Function};
use crate::expr::{Expr, Value};
use crate::space::{MappedImage, Section};
use crate::{Address, Architecture, Decoder, Insn, Operation, RegKind, Register};

const FLAGS: Register = Register::new(RegKind::Flags, 4);

/// Decoder that replays a fixed set of instructions keyed by address.
pub struct ScriptedDecoder {
    insns: HashMap<Address, Insn>,
}

impl ScriptedDecoder {
    pub fn new(insns: Vec<Insn>) -> Self {
        Self {
            insns: insns.into_iter().map(|insn| (insn.addr, insn)).collect(),
        }
    }
}

impl Decoder for ScriptedDecoder {
    fn decode(&self, bytes: &[u8], addr: Address) -> Option<Insn> {
        self.insns
            .get(&addr)
            .filter(|insn| bytes.len() >= insn.size as usize)
            .cloned()
    }

    fn architecture(&self) -> Architecture {
        Architecture::X86_32
    }
}

/// CFG store that counts every lookup made through it.
pub struct CountingCfg {
    inner: Cfg,
    pub lookups: AtomicUsize,
}

impl CountingCfg {
    pub fn new(inner: Cfg) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.lookups.fetch_add(1, Ordering::SeqCst);
    }
}

impl CfgStore for CountingCfg {
    fn function_by_entry(&self, addr: Address) -> Option<&Function> {
        self.hit();
        self.inner.function_by_entry(addr)
    }

    fn block_by_entry(&self, addr: Address) -> Option<&Block> {
        self.hit();
        self.inner.block_by_entry(addr)
    }

    fn blocks_covering(&self, addr: Address) -> Vec<&Block> {
        self.hit();
        self.inner.blocks_covering(addr)
    }

    fn sources(&self, block: &Block) -> Vec<&Edge> {
        self.hit();
        self.inner.sources(block)
    }
}

/// x86-32 image with one executable section of `len` nop bytes at `start`.
pub fn image(start: Address, len: usize) -> MappedImage {
    MappedImage::new(Architecture::X86_32, 0).with_section(Section::new(".text", start, vec![0x90; len], true))
}

/// Move an instruction to `addr`.
pub fn relocate(mut insn: Insn, addr: Address) -> Insn {
    insn.addr = addr;
    insn
}

/// An operand-less instruction, with the implicit stack accesses of the
/// stack-manipulating mnemonics filled in.
pub fn bare(addr: Address, size: u8, mnemonic: &str) -> Insn {
    let insn = Insn::new(addr, size, mnemonic);
    match insn.operation {
        Operation::Pusha | Operation::Popa | Operation::Pushf | Operation::Popf => {
            insn.reading(Register::ESP).writing(Register::ESP)
        }
        Operation::Leave | Operation::Enter => insn
            .reading(Register::ESP)
            .reading(Register::EBP)
            .writing(Register::ESP)
            .writing(Register::EBP),
        _ => insn,
    }
}

pub fn nop(addr: Address) -> Insn {
    bare(addr, 1, "nop")
}

pub fn leave(addr: Address) -> Insn {
    bare(addr, 1, "leave")
}

pub fn push(addr: Address, reg: Register) -> Insn {
    Insn::new(addr, 1, "push")
        .with_operand(Expr::reg(reg), reg.size())
        .reading(reg)
        .reading(Register::ESP)
        .writing(Register::ESP)
        .writing_memory(Expr::reg(Register::ESP))
}

pub fn pop(addr: Address, reg: Register) -> Insn {
    Insn::new(addr, 1, "pop")
        .with_operand(Expr::reg(reg), reg.size())
        .reading(Register::ESP)
        .writing(reg)
        .writing(Register::ESP)
        .reading_memory(Expr::reg(Register::ESP))
}

fn sp_arith(addr: Address, mnemonic: &str, source: Expr, source_size: u8, size: u8) -> Insn {
    let insn = Insn::new(addr, size, mnemonic)
        .with_operand(Expr::reg(Register::ESP), 4)
        .with_operand(source.clone(), source_size)
        .reading(Register::ESP);
    source
        .registers()
        .into_iter()
        .fold(insn, |insn, reg| insn.reading(reg))
        .writing(Register::ESP)
        .writing(FLAGS)
}

/// `add esp, imm` with an immediate of `imm_bytes` bytes.
pub fn add_sp(addr: Address, imm: i64, imm_bytes: u8) -> Insn {
    sp_arith(addr, "add", Expr::imm(Value::from_signed(imm, imm_bytes)), imm_bytes, 2 + imm_bytes)
}

/// `sub esp, imm` with an immediate of `imm_bytes` bytes.
pub fn sub_sp(addr: Address, imm: i64, imm_bytes: u8) -> Insn {
    sp_arith(addr, "sub", Expr::imm(Value::from_signed(imm, imm_bytes)), imm_bytes, 2 + imm_bytes)
}

/// `and esp, mask`
pub fn and_sp(addr: Address, mask: i64) -> Insn {
    sp_arith(addr, "and", Expr::imm(Value::from_signed(mask, 1)), 1, 3)
}

/// `add esp, reg`
pub fn add_sp_reg(addr: Address, reg: Register) -> Insn {
    sp_arith(addr, "add", Expr::reg(reg), reg.size(), 2)
}

/// `sub esp, reg`
pub fn sub_sp_reg(addr: Address, reg: Register) -> Insn {
    sp_arith(addr, "sub", Expr::reg(reg), reg.size(), 2)
}

/// `mov dst, src` between registers.
pub fn mov_rr(addr: Address, dst: Register, src: Register) -> Insn {
    Insn::new(addr, 2, "mov")
        .with_operand(Expr::reg(dst), dst.size())
        .with_operand(Expr::reg(src), src.size())
        .reading(src)
        .writing(dst)
}

/// `mov dst, [esp + disp]`
pub fn mov_from_stack(addr: Address, dst: Register, disp: i64) -> Insn {
    let (address, size) = if disp == 0 {
        (Expr::reg(Register::ESP), 3)
    } else {
        (Expr::add(Expr::reg(Register::ESP), Expr::imm(Value::from_signed(disp, 1))), 4)
    };
    Insn::new(addr, size, "mov")
        .with_operand(Expr::reg(dst), dst.size())
        .with_operand(Expr::deref(address.clone(), 4), 4)
        .reading(Register::ESP)
        .writing(dst)
        .reading_memory(address)
}

/// `lea dst, [source]`; `source` is the address computation.
pub fn lea(addr: Address, dst: Register, source: Expr) -> Insn {
    let insn = Insn::new(addr, 3, "lea")
        .with_operand(Expr::reg(dst), dst.size())
        .with_operand(source.clone(), 4);
    source
        .registers()
        .into_iter()
        .fold(insn, |insn, reg| insn.reading(reg))
        .writing(dst)
}

pub fn ret(addr: Address) -> Insn {
    Insn::new(addr, 1, "ret")
        .reading(Register::ESP)
        .writing(Register::ESP)
        .reading_memory(Expr::reg(Register::ESP))
}

/// `jmp target`, 5-byte rel32 form.
pub fn jmp(addr: Address, target: Address) -> Insn {
    Insn::new(addr, 5, "jmp").with_operand(Expr::imm(Value::address(target, 4)), 4)
}

/// `call target`, 5-byte rel32 form.
pub fn call(addr: Address, target: Address) -> Insn {
    Insn::new(addr, 5, "call")
        .with_operand(Expr::imm(Value::address(target, 4)), 4)
        .reading(Register::ESP)
        .writing(Register::ESP)
        .writing_memory(Expr::reg(Register::ESP))
}

/// `call reg`
pub fn call_reg(addr: Address, reg: Register) -> Insn {
    Insn::new(addr, 2, "call")
        .with_operand(Expr::reg(reg), reg.size())
        .reading(reg)
        .reading(Register::ESP)
        .writing(Register::ESP)
        .writing_memory(Expr::reg(Register::ESP))
}

/// `call dword ptr [slot]`
pub fn call_mem(addr: Address, slot: Address) -> Insn {
    let address = Expr::imm(Value::address(slot, 4));
    Insn::new(addr, 6, "call")
        .with_operand(Expr::deref(address.clone(), 4), 4)
        .reading(Register::ESP)
        .writing(Register::ESP)
        .reading_memory(address)
        .writing_memory(Expr::reg(Register::ESP))
}
