//! Instruction classifiers consulted while building the CFG.
//!
//! A [`Classifier`] is created for one call or branch site. It owns a cursor
//! positioned on the site's instruction, the block being parsed, and the
//! site's tail-call verdict cache. The predicates themselves live in the
//! submodules, each adding methods to [`Classifier`].

use std::collections::HashMap;
use std::fmt;

use crate::arch::RegisterMap;
use crate::cfg::{Block, CfgStore, EdgeType};
use crate::config::Mode;
use crate::cursor::InsnCursor;
use crate::space::{AddressSpace, CodeRegion};
use crate::{Address, Decoder, Insn};

mod fake_call;
mod frame;
mod iat;
mod nop;
mod tail_call;
mod thunk;

pub use fake_call::MAX_CHAIN_HOPS;
pub use frame::is_frame_setup;
pub use iat::MAX_IMPORT_NAME;
pub use nop::is_nop_insn;

/// Read-only collaborators shared by every site in a parsing session.
#[derive(Clone, Copy)]
pub struct ParseContext<'a> {
    pub decoder: &'a dyn Decoder,
    pub space: &'a dyn AddressSpace,
    pub cfg: &'a dyn CfgStore,
    /// Code region being parsed
    pub region: CodeRegion,
    pub regs: &'a RegisterMap,
    pub mode: Mode,
}

impl<'a> ParseContext<'a> {
    pub fn new(
        decoder: &'a dyn Decoder,
        space: &'a dyn AddressSpace,
        cfg: &'a dyn CfgStore,
        region: CodeRegion,
        regs: &'a RegisterMap,
        mode: Mode,
    ) -> Self {
        Self {
            decoder,
            space,
            cfg,
            region,
            regs,
            mode,
        }
    }

    /// A fresh cursor at `addr`, if an instruction decodes there.
    pub fn cursor_at(&self, addr: Address) -> Option<InsnCursor<'a>> {
        InsnCursor::at(self.decoder, self.space, self.region, addr)
    }
}

impl fmt::Debug for ParseContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseContext")
            .field("region", &self.region)
            .field("regs", &self.regs)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Classification state for one call or branch site.
pub struct Classifier<'a> {
    ctx: ParseContext<'a>,
    cursor: InsnCursor<'a>,
    block: Block,
    tail_calls: HashMap<EdgeType, bool>,
}

impl<'a> Classifier<'a> {
    /// Classifier for the cursor's current instruction inside `block`.
    ///
    /// The cursor's arena should hold the block's instructions from its
    /// start; tail-call detection looks backwards through it.
    pub fn new(ctx: ParseContext<'a>, cursor: InsnCursor<'a>, block: Block) -> Self {
        Self {
            ctx,
            cursor,
            block,
            tail_calls: HashMap::new(),
        }
    }

    /// Decode `block` from its start up to `addr` and build a classifier
    /// for the instruction there.
    ///
    /// Returns `None` if `addr` is not on an instruction boundary reachable
    /// from the block start.
    pub fn at(ctx: ParseContext<'a>, addr: Address, block: Block) -> Option<Self> {
        let mut cursor = ctx.cursor_at(block.start)?;
        while cursor.current().addr < addr {
            cursor.advance()?;
        }
        (cursor.current().addr == addr).then(|| Self::new(ctx, cursor, block))
    }

    pub fn current(&self) -> &Insn {
        self.cursor.current()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn context(&self) -> &ParseContext<'a> {
        &self.ctx
    }

    /// True if the current instruction has no effect worth modelling.
    pub fn is_nop(&self) -> bool {
        is_nop_insn(self.current())
    }

    /// Cached tail-call verdict for an edge type, if one was computed.
    pub fn cached_tail_call(&self, edge: EdgeType) -> Option<bool> {
        edge.branch_class().and_then(|kind| self.tail_calls.get(&kind).copied())
    }
}

impl fmt::Debug for Classifier<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("insn", self.current())
            .field("block", &self.block)
            .field("tail_calls", &self.tail_calls)
            .finish()
    }
}
