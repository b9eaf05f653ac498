//! Operand expressions and their evaluation.
//!
//! An operand is a small expression tree: a register, an immediate, a memory
//! dereference, or an arithmetic combination of those. Evaluation either
//! produces a concrete [`Value`] tagged with its width, or `None` when the
//! result depends on something we do not know (a register's contents, memory).

use std::fmt;

use crate::insn::Register;
use crate::Address;

/// Width and signedness of an evaluated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
}

impl Width {
    /// Signed width for an operand of `bytes` bytes.
    pub fn signed(bytes: u8) -> Option<Width> {
        match bytes {
            1 => Some(Width::S8),
            2 => Some(Width::S16),
            4 => Some(Width::S32),
            8 => Some(Width::S64),
            _ => None,
        }
    }

    /// Unsigned width for an operand of `bytes` bytes.
    pub fn unsigned(bytes: u8) -> Option<Width> {
        match bytes {
            1 => Some(Width::U8),
            2 => Some(Width::U16),
            4 => Some(Width::U32),
            8 => Some(Width::U64),
            _ => None,
        }
    }

    /// Size in bytes
    pub fn bytes(self) -> u8 {
        match self {
            Width::U8 | Width::S8 => 1,
            Width::U16 | Width::S16 => 2,
            Width::U32 | Width::S32 => 4,
            Width::U64 | Width::S64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Width::S8 | Width::S16 | Width::S32 | Width::S64)
    }

    fn mask(self) -> u64 {
        match self.bytes() {
            8 => u64::MAX,
            n => (1u64 << (n as u32 * 8)) - 1,
        }
    }

    /// The wider of two widths; signed if either side is signed.
    fn join(self, other: Width) -> Width {
        let bytes = self.bytes().max(other.bytes());
        let width = if self.is_signed() || other.is_signed() {
            Width::signed(bytes)
        } else {
            Width::unsigned(bytes)
        };
        width.unwrap_or(Width::S64)
    }
}

/// A definite value produced by evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value {
    bits: u64,
    width: Width,
}

impl Value {
    /// Build a value, truncating `bits` to `width`.
    pub fn new(bits: u64, width: Width) -> Self {
        Self {
            bits: bits & width.mask(),
            width,
        }
    }

    /// Build a signed value from an integer of `bytes` bytes.
    ///
    /// Unknown operand sizes are treated as 64-bit.
    pub fn from_signed(v: i64, bytes: u8) -> Self {
        Self::new(v as u64, Width::signed(bytes).unwrap_or(Width::S64))
    }

    /// Build a pointer-sized unsigned value.
    pub fn address(addr: Address, bytes: u8) -> Self {
        Self::new(addr, Width::unsigned(bytes).unwrap_or(Width::U64))
    }

    pub fn width(&self) -> Width {
        self.width
    }

    /// Raw bits, already truncated to the width.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Sign-extend according to the width tag.
    ///
    /// Unsigned narrow values are sign-extended as well: the stack simulator
    /// treats an 8-bit displacement of `0xf0` as `-16` regardless of tag.
    pub fn to_i64(self) -> i64 {
        match self.width {
            Width::U8 | Width::S8 => self.bits as u8 as i8 as i64,
            Width::U16 | Width::S16 => self.bits as u16 as i16 as i64,
            Width::U32 | Width::S32 => self.bits as u32 as i32 as i64,
            Width::U64 | Width::S64 => self.bits as i64,
        }
    }

    /// Interpret the value as an address (zero-extended bits).
    pub fn as_address(self) -> Address {
        self.bits
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.width.is_signed() && self.to_i64() < 0 {
            write!(f, "-0x{:x}", self.to_i64().unsigned_abs())
        } else {
            write!(f, "0x{:x}", self.bits)
        }
    }
}

/// Arithmetic combinators that appear in addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Mul,
}

/// Operand expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Register reference
    Reg(Register),
    /// Immediate constant
    Imm(Value),
    /// Memory read of `size` bytes at `addr`
    Deref { addr: Box<Expr>, size: u8 },
    /// Binary arithmetic
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn reg(reg: Register) -> Self {
        Expr::Reg(reg)
    }

    pub fn imm(value: Value) -> Self {
        Expr::Imm(value)
    }

    pub fn deref(addr: Expr, size: u8) -> Self {
        Expr::Deref {
            addr: Box::new(addr),
            size,
        }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op: BinOp::Mul,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Evaluate to a concrete value.
    ///
    /// Registers and memory contents are unknown, so any expression that
    /// depends on them is undefined.
    pub fn eval(&self) -> Option<Value> {
        match self {
            Expr::Reg(_) => None,
            Expr::Imm(value) => Some(*value),
            Expr::Deref { .. } => None,
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval()?;
                let r = rhs.eval()?;
                let width = l.width().join(r.width());
                let bits = match op {
                    BinOp::Add => l.to_i64().wrapping_add(r.to_i64()),
                    BinOp::Mul => l.to_i64().wrapping_mul(r.to_i64()),
                };
                Some(Value::new(bits as u64, width))
            }
        }
    }

    /// Sum of the constant displacement terms of an address computation.
    ///
    /// Looks through a top-level dereference. Immediates under a
    /// multiplication are scale factors, not displacements.
    pub fn displacement(&self) -> i64 {
        match self {
            Expr::Reg(_) => 0,
            Expr::Imm(value) => value.to_i64(),
            Expr::Deref { addr, .. } => addr.displacement(),
            Expr::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } => lhs.displacement().wrapping_add(rhs.displacement()),
            Expr::Binary { op: BinOp::Mul, .. } => 0,
        }
    }

    /// Every register mentioned anywhere in the expression.
    pub fn registers(&self) -> Vec<Register> {
        let mut regs = Vec::new();
        self.collect_registers(&mut regs);
        regs
    }

    fn collect_registers(&self, out: &mut Vec<Register>) {
        match self {
            Expr::Reg(reg) => out.push(*reg),
            Expr::Imm(_) => {}
            Expr::Deref { addr, .. } => addr.collect_registers(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_registers(out);
                rhs.collect_registers(out);
            }
        }
    }

    /// If the expression computes "one register plus zero", return that register.
    ///
    /// Any dereference, scaled term, second register, or non-zero constant
    /// disqualifies it.
    pub fn register_plus_zero(&self) -> Option<Register> {
        let mut shape = ZeroOffsetShape::default();
        shape.visit(self);
        match (shape.clean, shape.regs.as_slice()) {
            (true, [reg]) => Some(*reg),
            _ => None,
        }
    }
}

/// Accumulator for [`Expr::register_plus_zero`].
struct ZeroOffsetShape {
    regs: Vec<Register>,
    clean: bool,
}

impl Default for ZeroOffsetShape {
    fn default() -> Self {
        Self {
            regs: Vec::new(),
            clean: true,
        }
    }
}

impl ZeroOffsetShape {
    fn visit(&mut self, expr: &Expr) {
        match expr {
            Expr::Reg(reg) => self.regs.push(*reg),
            Expr::Imm(value) => {
                if value.bits() != 0 {
                    self.clean = false;
                }
            }
            Expr::Deref { .. } => self.clean = false,
            Expr::Binary {
                op: BinOp::Add,
                lhs,
                rhs,
            } => {
                self.visit(lhs);
                self.visit(rhs);
            }
            Expr::Binary { op: BinOp::Mul, .. } => self.clean = false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Reg(reg) => write!(f, "{}", reg),
            Expr::Imm(value) => write!(f, "{}", value),
            Expr::Deref { addr, .. } => write!(f, "[{}]", addr),
            Expr::Binary { op, lhs, rhs } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Mul => "*",
                };
                write!(f, "{} {} {}", lhs, sym, rhs)
            }
        }
    }
}
