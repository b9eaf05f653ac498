//! Whole-region survey: sweep a code region and classify every control
//! transfer found in it.

use std::time::Instant;

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cfg::Block;
use crate::classify::{Classifier, ParseContext};
use crate::cursor::decode_at;
use crate::space::{AddressSpace, CodeRegion};
use crate::{Address, Decoder, Insn};

/// Linear sweep over `region`, skipping one byte wherever nothing decodes.
pub fn linear_sweep(decoder: &dyn Decoder, space: &dyn AddressSpace, region: CodeRegion) -> Vec<Insn> {
    let start_time = Instant::now();
    let mut insns = Vec::new();
    let mut skipped = 0usize;
    let mut at = region.start;

    while at < region.end {
        match decode_at(decoder, space, region, at) {
            Some(insn) if insn.size > 0 => {
                at = insn.end();
                insns.push(insn);
            }
            _ => {
                at += 1;
                skipped += 1;
            }
        }
    }

    info!(
        "linear sweep of 0x{:x}..0x{:x} found {} instructions in {:?}, skipped {} bytes",
        region.start,
        region.end,
        insns.len(),
        start_time.elapsed(),
        skipped
    );
    insns
}

/// Kind of control transfer at a surveyed site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteKind {
    Call,
    Branch,
    Return,
}

impl SiteKind {
    fn of(insn: &Insn) -> Option<SiteKind> {
        if insn.is_call() {
            Some(SiteKind::Call)
        } else if insn.is_branch() {
            Some(SiteKind::Branch)
        } else if insn.is_return() {
            Some(SiteKind::Return)
        } else {
            None
        }
    }
}

/// Verdicts for one site; predicates that do not apply to the site's kind
/// are left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteReport {
    pub address: Address,
    pub kind: SiteKind,
    /// Disassembly text
    pub text: String,
    pub target: Option<Address>,
    pub thunk: Option<bool>,
    /// Only computed in defensive mode
    pub fake_call: Option<bool>,
    pub import: Option<String>,
    pub nop_jump: Option<bool>,
    pub cleans_stack: Option<bool>,
}

impl SiteReport {
    fn new(insn: &Insn, kind: SiteKind) -> Self {
        Self {
            address: insn.addr,
            kind,
            text: format!("{} {}", insn.mnemonic, insn.op_str).trim_end().to_string(),
            target: insn.target(),
            thunk: None,
            fake_call: None,
            import: None,
            nop_jump: None,
            cleans_stack: None,
        }
    }
}

/// Classify every call, branch, and return in `insns`, in parallel.
///
/// Each site gets its own [`Classifier`] over a single-instruction block,
/// so results are independent of survey order.
pub fn survey_calls(ctx: ParseContext<'_>, insns: &[Insn]) -> Vec<SiteReport> {
    let start_time = Instant::now();
    let reports: Vec<SiteReport> = insns
        .par_iter()
        .filter_map(|insn| {
            let kind = SiteKind::of(insn)?;
            let site = Classifier::at(ctx, insn.addr, Block::new(insn.addr, insn.end()))?;
            Some(classify_site(&site, kind))
        })
        .collect();

    info!(
        "surveyed {} sites in {:?} ({} calls)",
        reports.len(),
        start_time.elapsed(),
        reports.iter().filter(|r| r.kind == SiteKind::Call).count()
    );
    reports
}

fn classify_site(site: &Classifier<'_>, kind: SiteKind) -> SiteReport {
    let insn = site.current();
    let mut report = SiteReport::new(insn, kind);
    match kind {
        SiteKind::Call => {
            report.thunk = Some(site.is_thunk());
            if site.context().mode.is_defensive() {
                report.fake_call = Some(site.is_fake_call());
            }
            report.import = site.import_call_name();
        }
        SiteKind::Branch => report.nop_jump = Some(site.is_nop_jump()),
        SiteKind::Return => report.cleans_stack = Some(site.cleans_stack()),
    }
    debug!("site 0x{:x}: {:?}", insn.addr, report);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::RegisterMap;
    use crate::cfg::Cfg;
    use crate::config::Mode;
    use crate::fixtures::{self, ScriptedDecoder};
    use crate::{Architecture, Register};

    fn program() -> Vec<Insn> {
        vec![
            fixtures::call(0x1000, 0x1010),
            fixtures::jmp(0x1005, 0x100a),
            fixtures::ret(0x100a),
            fixtures::mov_from_stack(0x1010, Register::EBX, 0),
            fixtures::ret(0x1013),
        ]
    }

    #[test]
    fn test_linear_sweep_skips_gaps() {
        let decoder = ScriptedDecoder::new(vec![
            fixtures::push(0x1000, Register::EBP),
            fixtures::mov_rr(0x1001, Register::EBP, Register::ESP),
            fixtures::ret(0x1004),
        ]);
        let image = fixtures::image(0x1000, 0x10);
        let insns = linear_sweep(&decoder, &image, CodeRegion::new(0x1000, 0x1010));
        let addrs: Vec<Address> = insns.iter().map(|i| i.addr).collect();
        assert_eq!(addrs, vec![0x1000, 0x1001, 0x1004]);
    }

    #[test]
    fn test_linear_sweep_stops_at_region_end() {
        let decoder = ScriptedDecoder::new(vec![fixtures::ret(0x1000), fixtures::call(0x1001, 0x1000)]);
        let image = fixtures::image(0x1000, 0x10);
        let insns = linear_sweep(&decoder, &image, CodeRegion::new(0x1000, 0x1003));
        assert_eq!(insns.len(), 1);
    }

    #[test]
    fn test_survey_defensive() {
        let decoder = ScriptedDecoder::new(program());
        let image = fixtures::image(0x1000, 0x20);
        let cfg = Cfg::new();
        let regs = RegisterMap::for_architecture(Architecture::X86_32).unwrap();
        let region = CodeRegion::new(0x1000, 0x1020);
        let ctx = ParseContext::new(&decoder, &image, &cfg, region, &regs, Mode::Defensive);

        let insns = linear_sweep(&decoder, &image, region);
        let reports = survey_calls(ctx, &insns);
        let addrs: Vec<Address> = reports.iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x1005, 0x100a, 0x1013]);

        let call = &reports[0];
        assert_eq!(call.kind, SiteKind::Call);
        assert_eq!(call.target, Some(0x1010));
        assert_eq!(call.thunk, Some(true));
        assert_eq!(call.fake_call, Some(false));
        assert_eq!(call.import, None);
        assert_eq!(call.nop_jump, None);

        assert_eq!(reports[1].kind, SiteKind::Branch);
        assert_eq!(reports[1].nop_jump, Some(true));
        assert_eq!(reports[2].cleans_stack, Some(false));
    }

    #[test]
    fn test_survey_normal_mode_skips_fake_calls() {
        let decoder = ScriptedDecoder::new(program());
        let image = fixtures::image(0x1000, 0x20);
        let cfg = Cfg::new();
        let regs = RegisterMap::for_architecture(Architecture::X86_32).unwrap();
        let region = CodeRegion::new(0x1000, 0x1020);
        let ctx = ParseContext::new(&decoder, &image, &cfg, region, &regs, Mode::Normal);

        let reports = survey_calls(ctx, &linear_sweep(&decoder, &image, region));
        assert_eq!(reports[0].thunk, Some(true));
        assert_eq!(reports[0].fake_call, None);
    }
}
