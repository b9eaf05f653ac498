//! Instruction cursor over a block.
//!
//! The cursor owns an arena of instructions already decoded for the current
//! block and a position into it. Stepping past the end of the arena decodes
//! the next instruction from the address space and appends it, so callers
//! can look ahead freely without ever touching raw bytes.

use crate::classify::is_nop_insn;
use crate::space::{AddressSpace, CodeRegion};
use crate::{Address, Decoder, Insn};

/// Bidirectional, lazily extended view of a block's instructions.
#[derive(Clone)]
pub struct InsnCursor<'a> {
    decoder: &'a dyn Decoder,
    space: &'a dyn AddressSpace,
    region: CodeRegion,
    insns: Vec<Insn>,
    pos: usize,
}

impl<'a> InsnCursor<'a> {
    /// Wrap instructions the driver already decoded for the block, positioned
    /// at index `pos`.
    ///
    /// # Panics
    /// If `insns` is empty or `pos` is out of range.
    pub fn new(
        decoder: &'a dyn Decoder,
        space: &'a dyn AddressSpace,
        region: CodeRegion,
        insns: Vec<Insn>,
        pos: usize,
    ) -> Self {
        assert!(pos < insns.len(), "cursor position {} outside {} decoded instructions", pos, insns.len());
        Self {
            decoder,
            space,
            region,
            insns,
            pos,
        }
    }

    /// Decode the instruction at `addr` and start a fresh cursor there.
    pub fn at(
        decoder: &'a dyn Decoder,
        space: &'a dyn AddressSpace,
        region: CodeRegion,
        addr: Address,
    ) -> Option<Self> {
        let insn = decode_at(decoder, space, region, addr)?;
        Some(Self::new(decoder, space, region, vec![insn], 0))
    }

    pub fn current(&self) -> &Insn {
        &self.insns[self.pos]
    }

    /// Index of the current instruction within the block's arena.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of instructions decoded so far.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn region(&self) -> CodeRegion {
        self.region
    }

    /// Decoded instructions from the start of the arena through the current one.
    pub fn history(&self) -> &[Insn] {
        &self.insns[..=self.pos]
    }

    /// Move to the next instruction, decoding it if needed.
    ///
    /// Returns `None`, leaving the cursor where it was, when the next
    /// address runs off the region or does not decode.
    pub fn advance(&mut self) -> Option<&Insn> {
        if !self.fill(self.pos + 2) {
            return None;
        }
        self.pos += 1;
        Some(&self.insns[self.pos])
    }

    /// Up to `n` instructions following the current one.
    ///
    /// Fewer are returned if decoding stops early.
    pub fn ahead(&mut self, n: usize) -> &[Insn] {
        let want = self.pos + 1 + n;
        self.fill(want);
        let end = want.min(self.insns.len());
        &self.insns[self.pos + 1..end]
    }

    /// The current instruction followed by up to `n` more.
    pub fn current_and_ahead(&mut self, n: usize) -> &[Insn] {
        let want = self.pos + 1 + n;
        self.fill(want);
        let end = want.min(self.insns.len());
        &self.insns[self.pos..end]
    }

    /// The closest instruction before the current one that is not a no-op.
    pub fn previous_non_nop(&self) -> Option<&Insn> {
        self.insns[..self.pos].iter().rev().find(|insn| !is_nop_insn(insn))
    }

    /// Restart the cursor at `addr`, discarding the arena.
    ///
    /// Returns false, leaving the cursor untouched, if nothing decodes there.
    pub fn retarget(&mut self, addr: Address) -> bool {
        match decode_at(self.decoder, self.space, self.region, addr) {
            Some(insn) => {
                self.insns.clear();
                self.insns.push(insn);
                self.pos = 0;
                true
            }
            None => false,
        }
    }

    /// Decode until the arena holds `count` instructions. Returns whether it
    /// got there.
    fn fill(&mut self, count: usize) -> bool {
        while self.insns.len() < count {
            let next = match self.insns.last() {
                Some(last) => last.end(),
                None => return false,
            };
            match decode_at(self.decoder, self.space, self.region, next) {
                Some(insn) => self.insns.push(insn),
                None => return false,
            }
        }
        true
    }
}

/// Decode one instruction at `addr`, never reading past the region.
pub fn decode_at(
    decoder: &dyn Decoder,
    space: &dyn AddressSpace,
    region: CodeRegion,
    addr: Address,
) -> Option<Insn> {
    if !region.contains(addr) {
        return None;
    }
    let bytes = region.clamp(addr, space.instruction_bytes(addr)?);
    decoder.decode(bytes, addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ScriptedDecoder};

    fn setup() -> (ScriptedDecoder, crate::space::MappedImage) {
        let decoder = ScriptedDecoder::new(vec![
            fixtures::push(0x1000, crate::Register::EBP),
            fixtures::nop(0x1001),
            fixtures::mov_rr(0x1002, crate::Register::EBP, crate::Register::ESP),
            fixtures::nop(0x1004),
            fixtures::ret(0x1005),
        ]);
        (decoder, fixtures::image(0x1000, 0x10))
    }

    #[test]
    fn test_advance_decodes_on_demand() {
        let (decoder, image) = setup();
        let region = CodeRegion::new(0x1000, 0x1010);
        let mut cursor = InsnCursor::at(&decoder, &image, region, 0x1000).unwrap();
        assert_eq!(cursor.len(), 1);

        assert_eq!(cursor.advance().map(|i| i.addr), Some(0x1001));
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.len(), 2);

        let ahead: Vec<_> = cursor.ahead(2).iter().map(|i| i.addr).collect();
        assert_eq!(ahead, vec![0x1002, 0x1004]);
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn test_advance_stops_at_undecodable() {
        let (decoder, image) = setup();
        let region = CodeRegion::new(0x1000, 0x1010);
        let mut cursor = InsnCursor::at(&decoder, &image, region, 0x1005).unwrap();
        assert!(cursor.advance().is_none());
        assert_eq!(cursor.current().addr, 0x1005);
        assert!(cursor.ahead(3).is_empty());
    }

    #[test]
    fn test_region_bounds_decoding() {
        let (decoder, image) = setup();
        let region = CodeRegion::new(0x1000, 0x1002);
        let mut cursor = InsnCursor::at(&decoder, &image, region, 0x1000).unwrap();
        assert!(cursor.advance().is_some());
        assert!(cursor.advance().is_none());
        assert!(InsnCursor::at(&decoder, &image, region, 0x1004).is_none());
    }

    #[test]
    fn test_previous_skips_nops() {
        let (decoder, image) = setup();
        let region = CodeRegion::new(0x1000, 0x1010);
        let mut cursor = InsnCursor::at(&decoder, &image, region, 0x1000).unwrap();
        assert!(cursor.previous_non_nop().is_none());

        while cursor.current().addr != 0x1005 {
            cursor.advance().unwrap();
        }
        assert_eq!(cursor.previous_non_nop().map(|i| i.addr), Some(0x1002));
        assert_eq!(cursor.history().len(), 5);
    }

    #[test]
    fn test_retarget() {
        let (decoder, image) = setup();
        let region = CodeRegion::new(0x1000, 0x1010);
        let mut cursor = InsnCursor::at(&decoder, &image, region, 0x1000).unwrap();
        cursor.advance();
        assert!(cursor.retarget(0x1005));
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.len(), 1);
        assert!(!cursor.retarget(0x1003));
        assert_eq!(cursor.current().addr, 0x1005);
    }

    #[test]
    #[should_panic]
    fn test_new_rejects_bad_position() {
        let (decoder, image) = setup();
        let region = CodeRegion::new(0x1000, 0x1010);
        InsnCursor::new(&decoder, &image, region, Vec::new(), 0);
    }
}
