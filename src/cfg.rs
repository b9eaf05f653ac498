//! Read-only view of the CFG being recovered.
//!
//! The classifiers never mutate the graph. [`Cfg`] is a plain in-memory
//! implementation for drivers that do not bring their own store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Address;

/// Kind of a control-flow edge between blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    /// Unconditional direct jump
    Direct,
    /// Register or memory-indirect jump
    Indirect,
    /// Conditional jump, taken
    CondTaken,
    /// Conditional jump, not taken
    CondNotTaken,
    Call,
    /// Return site following a call
    CallFt,
    Ret,
    Fallthrough,
}

impl EdgeType {
    /// Collapse to the class used by tail-call analysis.
    ///
    /// All branch-like edges become [`EdgeType::Direct`]; everything else is
    /// never a tail call and yields `None`.
    pub fn branch_class(self) -> Option<EdgeType> {
        match self {
            EdgeType::Direct | EdgeType::Indirect | EdgeType::CondTaken => Some(EdgeType::Direct),
            EdgeType::CondNotTaken
            | EdgeType::Call
            | EdgeType::CallFt
            | EdgeType::Ret
            | EdgeType::Fallthrough => None,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeType::Direct => "direct",
            EdgeType::Indirect => "indirect",
            EdgeType::CondTaken => "cond_taken",
            EdgeType::CondNotTaken => "cond_not_taken",
            EdgeType::Call => "call",
            EdgeType::CallFt => "call_ft",
            EdgeType::Ret => "ret",
            EdgeType::Fallthrough => "fallthrough",
        };
        write!(f, "{}", name)
    }
}

/// Edge between two block start addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: Address,
    pub target: Address,
    pub kind: EdgeType,
}

impl Edge {
    pub fn new(source: Address, target: Address, kind: EdgeType) -> Self {
        Self { source, target, kind }
    }
}

/// One basic block, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub start: Address,
    pub end: Address,
}

impl Block {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    /// True if `addr` falls inside the block.
    pub fn covers(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// A function: an entry address and the blocks that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub entry: Address,
    blocks: BTreeSet<Address>,
}

impl Function {
    /// A function whose only known block is its entry block.
    pub fn new(entry: Address) -> Self {
        Self {
            entry,
            blocks: BTreeSet::from([entry]),
        }
    }

    pub fn with_block(mut self, start: Address) -> Self {
        self.blocks.insert(start);
        self
    }

    pub fn add_block(&mut self, start: Address) {
        self.blocks.insert(start);
    }

    pub fn contains(&self, block: &Block) -> bool {
        self.blocks.contains(&block.start)
    }

    /// Block start addresses, in order
    pub fn blocks(&self) -> impl Iterator<Item = Address> + '_ {
        self.blocks.iter().copied()
    }
}

/// Lookups the classifiers need from the CFG under construction.
pub trait CfgStore: Send + Sync {
    /// Function whose entry is exactly `addr`
    fn function_by_entry(&self, addr: Address) -> Option<&Function>;

    /// Block starting exactly at `addr`
    fn block_by_entry(&self, addr: Address) -> Option<&Block>;

    /// Every block whose range covers `addr`; more than one means
    /// overlapping instruction streams.
    fn blocks_covering(&self, addr: Address) -> Vec<&Block>;

    /// Incoming edges of `block`
    fn sources(&self, block: &Block) -> Vec<&Edge>;
}

/// In-memory CFG store.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    functions: BTreeMap<Address, Function>,
    blocks: BTreeMap<Address, Block>,
    edges: Vec<Edge>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.insert(function.entry, function);
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.insert(block.start, block);
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl CfgStore for Cfg {
    fn function_by_entry(&self, addr: Address) -> Option<&Function> {
        self.functions.get(&addr)
    }

    fn block_by_entry(&self, addr: Address) -> Option<&Block> {
        self.blocks.get(&addr)
    }

    fn blocks_covering(&self, addr: Address) -> Vec<&Block> {
        self.blocks.range(..=addr).map(|(_, b)| b).filter(|b| b.covers(addr)).collect()
    }

    fn sources(&self, block: &Block) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == block.start).collect()
    }
}
