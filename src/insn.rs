//! Decoded instruction view consumed by the classifiers.

use std::fmt;

use crate::expr::Expr;
use crate::{Address, MAX_INSTRUCTION_SIZE};

/// Register family. Registers of the same family alias each other
/// (`al`, `ax`, `eax` and `rax` are all [`RegKind::Ax`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegKind {
    Ax,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Sp,
    Bp,
    /// r8 through r15
    Gpr(u8),
    Ip,
    Flags,
    /// Segment register, indexed es, cs, ss, ds, fs, gs
    Seg(u8),
    /// Anything else, keyed by the decoder's register id
    Other(u16),
}

/// A register of a given family and width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    kind: RegKind,
    size: u8,
}

const LEGACY_NAMES: [(RegKind, [&str; 4]); 8] = [
    (RegKind::Ax, ["al", "ax", "eax", "rax"]),
    (RegKind::Bx, ["bl", "bx", "ebx", "rbx"]),
    (RegKind::Cx, ["cl", "cx", "ecx", "rcx"]),
    (RegKind::Dx, ["dl", "dx", "edx", "rdx"]),
    (RegKind::Si, ["sil", "si", "esi", "rsi"]),
    (RegKind::Di, ["dil", "di", "edi", "rdi"]),
    (RegKind::Sp, ["spl", "sp", "esp", "rsp"]),
    (RegKind::Bp, ["bpl", "bp", "ebp", "rbp"]),
];
const HIGH_BYTE_NAMES: [(RegKind, &str); 4] = [
    (RegKind::Ax, "ah"),
    (RegKind::Bx, "bh"),
    (RegKind::Cx, "ch"),
    (RegKind::Dx, "dh"),
];
const SEGMENT_NAMES: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];
const SIZES: [u8; 4] = [1, 2, 4, 8];

fn size_index(size: u8) -> Option<usize> {
    SIZES.iter().position(|&s| s == size)
}

impl Register {
    pub const EAX: Register = Register::new(RegKind::Ax, 4);
    pub const EBX: Register = Register::new(RegKind::Bx, 4);
    pub const ECX: Register = Register::new(RegKind::Cx, 4);
    pub const EDX: Register = Register::new(RegKind::Dx, 4);
    pub const ESI: Register = Register::new(RegKind::Si, 4);
    pub const EDI: Register = Register::new(RegKind::Di, 4);
    pub const ESP: Register = Register::new(RegKind::Sp, 4);
    pub const EBP: Register = Register::new(RegKind::Bp, 4);
    pub const EIP: Register = Register::new(RegKind::Ip, 4);
    pub const RAX: Register = Register::new(RegKind::Ax, 8);
    pub const RBX: Register = Register::new(RegKind::Bx, 8);
    pub const RSI: Register = Register::new(RegKind::Si, 8);
    pub const RDI: Register = Register::new(RegKind::Di, 8);
    pub const RSP: Register = Register::new(RegKind::Sp, 8);
    pub const RBP: Register = Register::new(RegKind::Bp, 8);
    pub const RIP: Register = Register::new(RegKind::Ip, 8);

    pub const fn new(kind: RegKind, size: u8) -> Self {
        Self { kind, size }
    }

    pub fn kind(&self) -> RegKind {
        self.kind
    }

    /// Width in bytes
    pub fn size(&self) -> u8 {
        self.size
    }

    /// True if both registers name (part of) the same architectural register.
    pub fn aliases(&self, other: &Register) -> bool {
        self.kind == other.kind
    }

    /// Parse an x86 register name as printed by the decoder.
    pub fn from_name(name: &str) -> Option<Register> {
        let name = name.to_ascii_lowercase();
        for (kind, names) in LEGACY_NAMES {
            if let Some(i) = names.iter().position(|n| *n == name) {
                return Some(Register::new(kind, SIZES[i]));
            }
        }
        if let Some((kind, _)) = HIGH_BYTE_NAMES.iter().find(|(_, n)| *n == name) {
            return Some(Register::new(*kind, 1));
        }
        if let Some(i) = SEGMENT_NAMES.iter().position(|n| *n == name) {
            return Some(Register::new(RegKind::Seg(i as u8), 2));
        }
        match name.as_str() {
            "ip" => return Some(Register::new(RegKind::Ip, 2)),
            "eip" => return Some(Register::new(RegKind::Ip, 4)),
            "rip" => return Some(Register::new(RegKind::Ip, 8)),
            "flags" => return Some(Register::new(RegKind::Flags, 2)),
            "eflags" => return Some(Register::new(RegKind::Flags, 4)),
            "rflags" => return Some(Register::new(RegKind::Flags, 8)),
            _ => {}
        }

        // r8 .. r15 with optional b/w/d suffix
        let rest = name.strip_prefix('r')?;
        let (digits, size) = match rest.as_bytes().last().copied()? {
            b'b' => (&rest[..rest.len() - 1], 1),
            b'w' => (&rest[..rest.len() - 1], 2),
            b'd' => (&rest[..rest.len() - 1], 4),
            _ => (rest, 8),
        };
        let n: u8 = digits.parse().ok()?;
        (8..=15)
            .contains(&n)
            .then(|| Register::new(RegKind::Gpr(n), size))
    }

    /// Canonical lower-case name
    pub fn name(&self) -> String {
        let idx = size_index(self.size);
        match self.kind {
            RegKind::Gpr(n) => match self.size {
                1 => format!("r{}b", n),
                2 => format!("r{}w", n),
                4 => format!("r{}d", n),
                _ => format!("r{}", n),
            },
            RegKind::Ip => ["ip", "ip", "eip", "rip"][idx.unwrap_or(3)].to_string(),
            RegKind::Flags => ["flags", "flags", "eflags", "rflags"][idx.unwrap_or(3)].to_string(),
            RegKind::Seg(i) => SEGMENT_NAMES
                .get(i as usize)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("seg{}", i)),
            RegKind::Other(id) => format!("reg{}", id),
            kind => LEGACY_NAMES
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, names)| names[idx.unwrap_or(3)].to_string())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Control-flow category of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Call,
    Branch,
    Return,
    Other,
}

/// Operation identity, as far as the classifiers care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Nop,
    Mov,
    Lea,
    Push,
    Pop,
    /// pusha / pushad
    Pusha,
    /// popa / popad
    Popa,
    /// pushf / pushfd / pushfq
    Pushf,
    /// popf / popfd / popfq
    Popf,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Xchg,
    Leave,
    Enter,
    Call,
    Jmp,
    /// Conditional jumps, loop and jcxz families
    Jcc,
    Ret,
    Other,
}

impl Operation {
    /// Map a decoder mnemonic to an operation.
    ///
    /// Prefixes printed as part of the mnemonic (`rep ret`, `bnd jmp`,
    /// `notrack call`) are ignored.
    pub fn from_mnemonic(mnemonic: &str) -> Self {
        let lower = mnemonic.to_ascii_lowercase();
        let base = lower.split_whitespace().last().unwrap_or("");
        match base {
            "nop" => Operation::Nop,
            "mov" => Operation::Mov,
            "lea" => Operation::Lea,
            "push" => Operation::Push,
            "pop" => Operation::Pop,
            "pusha" | "pushal" | "pushad" | "pushaw" => Operation::Pusha,
            "popa" | "popal" | "popad" | "popaw" => Operation::Popa,
            "pushf" | "pushfd" | "pushfq" | "pushfw" => Operation::Pushf,
            "popf" | "popfd" | "popfq" | "popfw" => Operation::Popf,
            "add" => Operation::Add,
            "sub" => Operation::Sub,
            "and" => Operation::And,
            "or" => Operation::Or,
            "xor" => Operation::Xor,
            "cmp" => Operation::Cmp,
            "test" => Operation::Test,
            "inc" => Operation::Inc,
            "dec" => Operation::Dec,
            "xchg" => Operation::Xchg,
            "leave" => Operation::Leave,
            "enter" => Operation::Enter,
            "call" | "lcall" => Operation::Call,
            "jmp" | "ljmp" => Operation::Jmp,
            "ret" | "retn" | "retf" | "retq" | "retl" | "iret" | "iretd" | "iretq" => Operation::Ret,
            m if m.starts_with('j') || m.starts_with("loop") => Operation::Jcc,
            _ => Operation::Other,
        }
    }

    pub fn category(self) -> Category {
        match self {
            Operation::Call => Category::Call,
            Operation::Jmp | Operation::Jcc => Category::Branch,
            Operation::Ret => Category::Return,
            _ => Category::Other,
        }
    }

    /// How the first explicit operand is accessed, as `(read, written)`.
    ///
    /// x86 puts the destination first; every later operand is a source.
    pub fn destination_access(self) -> (bool, bool) {
        match self {
            Operation::Mov | Operation::Lea | Operation::Pop => (false, true),
            Operation::Push
            | Operation::Cmp
            | Operation::Test
            | Operation::Call
            | Operation::Jmp
            | Operation::Jcc
            | Operation::Ret
            | Operation::Enter => (true, false),
            Operation::Nop
            | Operation::Pusha
            | Operation::Popa
            | Operation::Pushf
            | Operation::Popf
            | Operation::Leave => (false, false),
            Operation::Add
            | Operation::Sub
            | Operation::And
            | Operation::Or
            | Operation::Xor
            | Operation::Inc
            | Operation::Dec
            | Operation::Xchg
            | Operation::Other => (true, true),
        }
    }
}

/// One explicit operand: its value expression and size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub expr: Expr,
    pub size: u8,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Operands as printed by the decoder
    pub op_str: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    pub operation: Operation,
    pub category: Category,
    /// Explicit operands, destination first
    pub operands: Vec<Operand>,
    /// Registers read, explicit and implicit
    pub regs_read: Vec<Register>,
    /// Registers written, explicit and implicit
    pub regs_written: Vec<Register>,
    /// Address expressions of memory locations read
    pub mem_reads: Vec<Expr>,
    /// Address expressions of memory locations written
    pub mem_writes: Vec<Expr>,
}

impl Insn {
    /// Create an instruction with no operands; operation and category come
    /// from the mnemonic.
    pub fn new(addr: Address, size: u8, mnemonic: &str) -> Self {
        let operation = Operation::from_mnemonic(mnemonic);
        Self {
            addr,
            size,
            mnemonic: mnemonic.to_string(),
            op_str: String::new(),
            bytes: [0; MAX_INSTRUCTION_SIZE],
            operation,
            category: operation.category(),
            operands: Vec::new(),
            regs_read: Vec::new(),
            regs_written: Vec::new(),
            mem_reads: Vec::new(),
            mem_writes: Vec::new(),
        }
    }

    pub fn with_operand(mut self, expr: Expr, size: u8) -> Self {
        if !self.op_str.is_empty() {
            self.op_str.push_str(", ");
        }
        self.op_str.push_str(&expr.to_string());
        self.operands.push(Operand { expr, size });
        self
    }

    pub fn reading(mut self, reg: Register) -> Self {
        if !self.regs_read.contains(&reg) {
            self.regs_read.push(reg);
        }
        self
    }

    pub fn writing(mut self, reg: Register) -> Self {
        if !self.regs_written.contains(&reg) {
            self.regs_written.push(reg);
        }
        self
    }

    pub fn reading_memory(mut self, addr: Expr) -> Self {
        self.mem_reads.push(addr);
        self
    }

    pub fn writing_memory(mut self, addr: Expr) -> Self {
        self.mem_writes.push(addr);
        self
    }

    pub fn with_bytes(mut self, raw: &[u8]) -> Self {
        let n = raw.len().min(MAX_INSTRUCTION_SIZE);
        self.bytes[..n].copy_from_slice(&raw[..n]);
        self
    }

    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..(self.size as usize).min(MAX_INSTRUCTION_SIZE)]
    }

    /// Address of the following instruction, saturating at the top of the
    /// address space
    pub fn end(&self) -> Address {
        self.addr.saturating_add(self.size as Address)
    }

    pub fn operand(&self, idx: usize) -> Option<&Operand> {
        self.operands.get(idx)
    }

    /// True if any register aliasing `reg` is read.
    pub fn reads(&self, reg: &Register) -> bool {
        self.regs_read.iter().any(|r| r.aliases(reg))
    }

    /// True if any register aliasing `reg` is written.
    pub fn writes(&self, reg: &Register) -> bool {
        self.regs_written.iter().any(|r| r.aliases(reg))
    }

    pub fn reads_memory(&self) -> bool {
        !self.mem_reads.is_empty()
    }

    pub fn writes_memory(&self) -> bool {
        !self.mem_writes.is_empty()
    }

    pub fn is_call(&self) -> bool {
        self.category == Category::Call
    }

    pub fn is_branch(&self) -> bool {
        self.category == Category::Branch
    }

    pub fn is_return(&self) -> bool {
        self.category == Category::Return
    }

    /// Control-flow target, when it can be computed statically.
    ///
    /// Only calls and branches have one; register and memory-indirect
    /// transfers evaluate to undefined and yield `None`.
    pub fn target(&self) -> Option<Address> {
        if !matches!(self.category, Category::Call | Category::Branch) {
            return None;
        }
        self.operand(0)?.expr.eval().map(|v| v.as_address())
    }

    /// True for calls and branches whose target is a register or memory operand.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.category, Category::Call | Category::Branch)
            && !matches!(self.operand(0).map(|op| &op.expr), Some(Expr::Imm(_)))
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.op_str)
    }
}
