//! Address-space view: which addresses are mapped, which hold code, and the
//! bytes behind them.

use crate::{Address, Architecture};

/// Read-only view of a loaded binary.
pub trait AddressSpace: Send + Sync {
    /// Architecture of the code in this space
    fn architecture(&self) -> Architecture;

    /// True if `addr` is backed by bytes.
    fn is_valid_address(&self, addr: Address) -> bool;

    /// True if `addr` lies in an executable mapping.
    fn is_code(&self, addr: Address) -> bool;

    /// Bytes from `addr` to the end of its executable mapping.
    fn instruction_bytes(&self, addr: Address) -> Option<&[u8]>;

    /// Bytes from `addr` to the end of its mapping, executable or not.
    fn data_bytes(&self, addr: Address) -> Option<&[u8]>;

    /// Difference between preferred load address and the addresses used by
    /// this space (the PE image base, zero for most ELF images).
    fn load_bias(&self) -> Address;

    /// Read a little-endian pointer of `width` bytes at `addr`.
    fn read_pointer(&self, addr: Address, width: u8) -> Option<Address> {
        let bytes = self.data_bytes(addr)?;
        let raw = bytes.get(..width as usize)?;
        let mut buf = [0u8; 8];
        buf.get_mut(..raw.len())?.copy_from_slice(raw);
        Some(u64::from_le_bytes(buf))
    }
}

/// A contiguous range of code being parsed, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRegion {
    pub start: Address,
    pub end: Address,
}

impl CodeRegion {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Trim `bytes`, which start at `addr`, so they do not run past the region.
    pub fn clamp<'b>(&self, addr: Address, bytes: &'b [u8]) -> &'b [u8] {
        let room = self.end.saturating_sub(addr) as usize;
        &bytes[..bytes.len().min(room)]
    }
}

/// A section in the binary, with its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name
    pub name: String,
    /// Starting address of the section
    pub address: Address,
    /// Contents; may be shorter than the in-memory size
    pub bytes: Vec<u8>,
    /// Whether this section contains executable code
    pub executable: bool,
}

impl Section {
    /// Create a new section
    pub fn new(name: impl Into<String>, address: Address, bytes: Vec<u8>, executable: bool) -> Self {
        Self {
            name: name.into(),
            address,
            bytes,
            executable,
        }
    }

    /// Get the end address of this section, saturating at the top of the
    /// address space
    pub fn end_address(&self) -> Address {
        self.address.saturating_add(self.bytes.len() as Address)
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.checked_sub(self.address)
            .is_some_and(|offset| offset < self.bytes.len() as Address)
    }

    fn bytes_from(&self, addr: Address) -> Option<&[u8]> {
        if !self.contains(addr) {
            return None;
        }
        self.bytes.get((addr - self.address) as usize..)
    }
}

/// An image made of sections, as produced by [`crate::parser::GoblinParser`].
#[derive(Debug, Clone)]
pub struct MappedImage {
    /// Detected architecture
    pub architecture: Architecture,
    /// Entry point address, if available
    pub entry_point: Option<Address>,
    /// Preferred load address subtracted from absolute pointers
    pub load_bias: Address,
    /// Mapped sections
    pub sections: Vec<Section>,
}

impl MappedImage {
    pub fn new(architecture: Architecture, load_bias: Address) -> Self {
        Self {
            architecture,
            entry_point: None,
            load_bias,
            sections: Vec::new(),
        }
    }

    /// Add a section, builder style.
    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Find a section by name
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section holding `addr`
    pub fn section_containing(&self, addr: Address) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(addr))
    }

    /// Get all executable sections
    pub fn executable_sections(&self) -> Vec<&Section> {
        self.sections.iter().filter(|s| s.executable && !s.bytes.is_empty()).collect()
    }

    /// One code region per executable section
    pub fn code_regions(&self) -> Vec<CodeRegion> {
        self.executable_sections()
            .into_iter()
            .map(|s| CodeRegion::new(s.address, s.end_address()))
            .collect()
    }
}

impl AddressSpace for MappedImage {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_valid_address(&self, addr: Address) -> bool {
        self.section_containing(addr).is_some()
    }

    fn is_code(&self, addr: Address) -> bool {
        self.section_containing(addr).is_some_and(|s| s.executable)
    }

    fn instruction_bytes(&self, addr: Address) -> Option<&[u8]> {
        self.sections
            .iter()
            .filter(|s| s.executable)
            .find_map(|s| s.bytes_from(addr))
    }

    fn data_bytes(&self, addr: Address) -> Option<&[u8]> {
        self.sections.iter().find_map(|s| s.bytes_from(addr))
    }

    fn load_bias(&self) -> Address {
        self.load_bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> MappedImage {
        MappedImage::new(Architecture::X86_32, 0x40_0000)
            .with_section(Section::new(".text", 0x1000, vec![0x90; 0x10], true))
            .with_section(Section::new(".rdata", 0x2000, vec![0x34, 0x12, 0, 0, 0xff], false))
    }

    #[test]
    fn test_validity_and_code() {
        let img = image();
        assert!(img.is_valid_address(0x1000));
        assert!(img.is_code(0x100f));
        assert!(!img.is_valid_address(0x1010));
        assert!(img.is_valid_address(0x2000));
        assert!(!img.is_code(0x2000));
    }

    #[test]
    fn test_byte_views() {
        let img = image();
        assert_eq!(img.instruction_bytes(0x100e).unwrap().len(), 2);
        assert!(img.instruction_bytes(0x2000).is_none());
        assert_eq!(img.data_bytes(0x2004).unwrap(), &[0xff]);
    }

    #[test]
    fn test_read_pointer() {
        let img = image();
        assert_eq!(img.read_pointer(0x2000, 4), Some(0x1234));
        assert_eq!(img.read_pointer(0x2002, 4), None);
    }

    #[test]
    fn test_section_at_top_of_address_space() {
        let img = MappedImage::new(Architecture::X86_64, 0)
            .with_section(Section::new(".text", u64::MAX - 3, vec![0x90; 8], true));
        assert!(img.is_valid_address(u64::MAX - 1));
        assert!(img.is_code(u64::MAX));
        assert!(!img.is_valid_address(u64::MAX - 4));
        assert_eq!(img.sections[0].end_address(), u64::MAX);
        assert_eq!(img.data_bytes(u64::MAX).unwrap().len(), 5);
        assert_eq!(img.code_regions(), vec![CodeRegion::new(u64::MAX - 3, u64::MAX)]);
    }

    #[test]
    fn test_code_region() {
        let img = image();
        let regions = img.code_regions();
        assert_eq!(regions, vec![CodeRegion::new(0x1000, 0x1010)]);

        let region = regions[0];
        assert!(region.contains(0x1000));
        assert!(!region.contains(0x1010));
        assert_eq!(region.len(), 0x10);
        assert_eq!(region.clamp(0x100c, &[1, 2, 3, 4, 5, 6]), &[1, 2, 3, 4]);
    }
}
