//! Capstone-based x86 decoder producing classifier instructions.
//!
//! Capstone runs in detail mode so that operands, implicit register accesses,
//! and memory operands can be lifted into [`Expr`] trees.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use capstone::arch::x86::{ArchMode as X86Mode, X86OpMem, X86OperandType};
use capstone::prelude::*;

use crate::expr::{Expr, Value};
use crate::insn::Operand;
use crate::{Address, Architecture, Decoder, Insn, Operation, RegKind, Register, MAX_INSTRUCTION_SIZE};

/// Errors that can occur while setting up a decoder
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
}

thread_local! {
    // One detail-mode Capstone handle per architecture and thread
    static CS_POOL: RefCell<HashMap<Architecture, Rc<Capstone>>> = RefCell::new(HashMap::new());
}

/// x86 decoder backed by Capstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapstoneDecoder {
    arch: Architecture,
}

impl CapstoneDecoder {
    /// Create a decoder for a specific architecture.
    ///
    /// Only x86-32 and x86-64 are supported.
    pub fn for_architecture(arch: Architecture) -> Result<Self, DecoderError> {
        let decoder = Self { arch };
        decoder.handle()?;
        Ok(decoder)
    }

    /// Build a detail-mode Capstone handle for `arch`
    pub fn build(arch: Architecture) -> Result<Capstone, DecoderError> {
        let mode = match arch {
            Architecture::X86_32 => X86Mode::Mode32,
            Architecture::X86_64 => X86Mode::Mode64,
            _ => return Err(DecoderError::UnsupportedArchitecture(arch)),
        };
        Ok(Capstone::new().x86().mode(mode).detail(true).build()?)
    }

    /// Address width in bytes
    pub fn address_width(&self) -> u8 {
        match self.arch {
            Architecture::X86_64 => 8,
            _ => 4,
        }
    }

    /// This thread's handle, built on first use.
    fn handle(&self) -> Result<Rc<Capstone>, DecoderError> {
        CS_POOL.with(|cell| {
            let mut pool = cell.borrow_mut();
            if let Some(cs) = pool.get(&self.arch) {
                return Ok(cs.clone());
            }
            let cs = Rc::new(Self::build(self.arch)?);
            pool.insert(self.arch, cs.clone());
            Ok(cs)
        })
    }

    fn lift(&self, cs: &Capstone, raw: &capstone::Insn) -> Option<Insn> {
        let mut insn = Insn::new(raw.address(), raw.len() as u8, raw.mnemonic().unwrap_or("")).with_bytes(raw.bytes());
        insn.op_str = raw.op_str().unwrap_or("").to_string();

        let detail = cs.insn_detail(raw).ok()?;
        let arch_detail = detail.arch_detail();
        let x86 = arch_detail.x86()?;

        let width = self.address_width();
        let next = insn.end();
        let is_transfer = insn.is_call() || insn.is_branch();
        let (dest_read, dest_written) = insn.operation.destination_access();

        for (i, op) in x86.operands().enumerate() {
            let (read, written) = if i == 0 { (dest_read, dest_written) } else { (true, false) };
            let expr = match op.op_type {
                X86OperandType::Reg(id) => {
                    let reg = register(cs, id);
                    if read {
                        insn = insn.reading(reg);
                    }
                    if written {
                        insn = insn.writing(reg);
                    }
                    Expr::reg(reg)
                }
                X86OperandType::Imm(imm) if is_transfer => Expr::imm(Value::address(imm as u64, width)),
                X86OperandType::Imm(imm) => Expr::imm(Value::from_signed(imm, op.size)),
                X86OperandType::Mem(mem) => {
                    let address = address_expr(cs, &mem, next, width);
                    for reg in address.registers() {
                        insn = insn.reading(reg);
                    }
                    match insn.operation {
                        // lea computes the address; nothing is loaded
                        Operation::Lea => address,
                        Operation::Nop => Expr::deref(address, op.size),
                        _ => {
                            if read {
                                insn.mem_reads.push(address.clone());
                            }
                            if written {
                                insn.mem_writes.push(address.clone());
                            }
                            Expr::deref(address, op.size)
                        }
                    }
                }
                X86OperandType::Invalid => continue,
            };
            insn.operands.push(Operand { expr, size: op.size });
        }

        for id in detail.regs_read() {
            insn = insn.reading(register(cs, *id));
        }
        for id in detail.regs_write() {
            insn = insn.writing(register(cs, *id));
        }

        // Implicit stack slot accesses
        let sp = Expr::reg(if width == 8 { Register::RSP } else { Register::ESP });
        match insn.operation {
            Operation::Push | Operation::Pusha | Operation::Pushf | Operation::Call => insn.mem_writes.push(sp),
            Operation::Pop | Operation::Popa | Operation::Popf | Operation::Ret => insn.mem_reads.push(sp),
            _ => {}
        }

        Some(insn)
    }
}

/// Map a Capstone register id to a classifier register.
fn register(cs: &Capstone, id: RegId) -> Register {
    cs.reg_name(id)
        .and_then(|name| Register::from_name(&name))
        .unwrap_or(Register::new(RegKind::Other(id.0), 0))
}

/// `base + index * scale + disp`, with RIP-relative forms folded into an
/// absolute address.
fn address_expr(cs: &Capstone, mem: &X86OpMem, next: Address, width: u8) -> Expr {
    let disp = mem.disp();
    if mem.base().0 != 0 && register(cs, mem.base()).kind() == RegKind::Ip {
        return Expr::imm(Value::address(next.wrapping_add(disp as u64), width));
    }

    let mut terms = Vec::new();
    if mem.base().0 != 0 {
        terms.push(Expr::reg(register(cs, mem.base())));
    }
    if mem.index().0 != 0 {
        let index = Expr::reg(register(cs, mem.index()));
        terms.push(match mem.scale() {
            1 => index,
            scale => Expr::mul(index, Expr::imm(Value::from_signed(scale as i64, 1))),
        });
    }
    if terms.is_empty() {
        // Absolute address; Capstone sign-extends the 32-bit displacement
        return Expr::imm(Value::address(disp as u64, width));
    }
    if disp != 0 {
        terms.push(Expr::imm(Value::from_signed(disp, width)));
    }
    let mut terms = terms.into_iter();
    let first = terms.next().unwrap_or(Expr::imm(Value::address(0, width)));
    terms.fold(first, Expr::add)
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.arch)
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, bytes: &[u8], addr: Address) -> Option<Insn> {
        // Only look at a small slice (16 bytes max)
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_SIZE)];
        if window.is_empty() {
            return None;
        }

        let cs = self.handle().ok()?;
        let disasm_result = cs.disasm_count(window, addr, 1).ok()?;
        let raw = disasm_result.iter().next()?;

        // Ensure instruction starts at the address we requested
        if raw.address() != addr {
            return None;
        }
        self.lift(&cs, &raw)
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }
}
