//! Indirect calls through import table slots.

use log::info;

use super::Classifier;
use crate::space::AddressSpace;
use crate::Address;

/// Longest import name accepted, terminator included.
pub const MAX_IMPORT_NAME: usize = 100;

/// Bytes of the hint field that precede the name pointer in an import entry.
const HINT_SIZE: Address = 2;

impl Classifier<'_> {
    /// Name of the imported function if the current instruction is an
    /// indirect call through an import table slot.
    pub fn import_call_name(&self) -> Option<String> {
        let insn = self.current();
        if !insn.is_call() || !insn.is_dynamic() || !insn.reads_memory() {
            return None;
        }
        let [slot] = insn.mem_reads.as_slice() else {
            return None;
        };
        let mut entry = slot.eval()?.as_address();

        let space = self.ctx.space;
        let bias = space.load_bias();
        if bias < entry {
            entry -= bias;
        }
        if !space.is_valid_address(entry) {
            return None;
        }

        let name_addr = space.read_pointer(entry.checked_add(HINT_SIZE)?, self.ctx.regs.address_width())?;
        if !space.is_valid_address(name_addr) {
            return None;
        }
        let name = read_import_name(space, name_addr)?;
        info!("found IAT call at 0x{:x} to {}", insn.addr, name);
        Some(name)
    }
}

/// NUL-terminated identifier at `addr`, if it looks like a symbol name.
fn read_import_name(space: &dyn AddressSpace, addr: Address) -> Option<String> {
    let bytes = space.data_bytes(addr)?;
    let window = &bytes[..bytes.len().min(MAX_IMPORT_NAME)];
    let len = window.iter().position(|&b| b == 0)?;
    let name = &window[..len];
    if name.is_empty() || !name.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    String::from_utf8(name.to_vec()).ok()
}
