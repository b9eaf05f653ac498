//! Goblin-based loader producing a [`MappedImage`] from ELF, PE, or Mach-O.

use std::fmt;

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};
use log::debug;

use crate::space::{MappedImage, Section};
use crate::{Address, Architecture, BinaryParser, ClassifyError};

/// Mach-O `VM_PROT_EXECUTE`
const VM_PROT_EXECUTE: u32 = 0x4;

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse an ELF image; allocated sections are mapped at their addresses.
    fn parse_elf(&self, elf: elf::Elf, img: &[u8]) -> Result<MappedImage, ClassifyError> {
        let mut image = MappedImage::new(elf_architecture(elf.header.e_machine), 0);
        image.entry_point = Some(elf.entry);

        for sh in &elf.section_headers {
            if sh.sh_addr == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
            let bytes = if sh.sh_type == elf::section_header::SHT_NOBITS {
                Vec::new()
            } else {
                file_range(img, sh.sh_offset, sh.sh_size)?.to_vec()
            };
            image.sections.push(mapped_section(name, sh.sh_addr, bytes, sh.is_executable())?);
        }
        Ok(image)
    }

    /// Parse a PE image; sections are mapped at their RVAs and the image
    /// base becomes the load bias.
    fn parse_pe(&self, pe: pe::PE<'_>, img: &[u8]) -> Result<MappedImage, ClassifyError> {
        let mut image = MappedImage::new(pe_architecture(pe.header.coff_header.machine), pe.image_base as Address);
        image.entry_point = Some(pe.entry as Address);

        for sect in &pe.sections {
            let name = sect.name().unwrap_or("");
            let executable = (sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE) != 0;
            let mut size = sect.size_of_raw_data as u64;
            if sect.virtual_size != 0 {
                size = size.min(sect.virtual_size as u64);
            }
            let bytes = file_range(img, sect.pointer_to_raw_data as u64, size)?.to_vec();
            image
                .sections
                .push(mapped_section(name, sect.virtual_address as Address, bytes, executable)?);
        }
        Ok(image)
    }

    /// Parse a single-architecture Mach-O image, one section per segment.
    fn parse_macho(&self, macho: &MachO) -> Result<MappedImage, ClassifyError> {
        let mut image = MappedImage::new(macho_architecture(macho.header.cputype), 0);
        image.entry_point = Some(macho.entry);

        for segment in &macho.segments {
            let name = segment.name().unwrap_or("");
            let executable = (segment.initprot & VM_PROT_EXECUTE) != 0;
            image
                .sections
                .push(mapped_section(name, segment.vmaddr, segment.data.to_vec(), executable)?);
        }
        Ok(image)
    }

    fn parse_mach(&self, m: Mach<'_>) -> Result<MappedImage, ClassifyError> {
        match m {
            Mach::Binary(binary) => self.parse_macho(&binary),
            Mach::Fat(_) => Err(ClassifyError::ParsingError(
                "fat Mach-O archives are not supported".into(),
            )),
        }
    }
}

/// `len` bytes of the file at `offset`
fn file_range(img: &[u8], offset: u64, len: u64) -> Result<&[u8], ClassifyError> {
    let start = offset as usize;
    let end = start.saturating_add(len as usize);
    img.get(start..end).ok_or_else(|| {
        ClassifyError::ParsingError(format!("section data 0x{:x}..0x{:x} lies outside the file", start, end))
    })
}

/// A section whose bytes fit below the top of the address space
fn mapped_section(name: &str, address: Address, bytes: Vec<u8>, executable: bool) -> Result<Section, ClassifyError> {
    if address.checked_add(bytes.len() as Address).is_none() {
        return Err(ClassifyError::ParsingError(format!(
            "section {} at 0x{:x} wraps the address space",
            name, address
        )));
    }
    Ok(Section::new(name, address, bytes, executable))
}

fn elf_architecture(machine: u16) -> Architecture {
    match machine {
        elf::header::EM_386 => Architecture::X86_32,
        elf::header::EM_X86_64 => Architecture::X86_64,
        elf::header::EM_ARM => Architecture::Arm,
        elf::header::EM_AARCH64 => Architecture::AArch64,
        _ => Architecture::Unknown,
    }
}

fn pe_architecture(machine: u16) -> Architecture {
    match machine {
        pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
        pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
        pe::header::COFF_MACHINE_ARM => Architecture::Arm,
        pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
        _ => Architecture::Unknown,
    }
}

fn macho_architecture(cpu: u32) -> Architecture {
    match cpu {
        cputype::CPU_TYPE_I386 => Architecture::X86_32,
        cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
        cputype::CPU_TYPE_ARM => Architecture::Arm,
        cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
        _ => Architecture::Unknown,
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl BinaryParser for GoblinParser {
    fn parse(&self, data: &[u8]) -> Result<MappedImage, ClassifyError> {
        let image = match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.parse_elf(elf, data),
            Ok(Object::PE(pe)) => self.parse_pe(pe, data),
            Ok(Object::Mach(m)) => self.parse_mach(m),
            Ok(_) => Err(ClassifyError::ParsingError("Unsupported file format".into())),
            Err(e) => Err(ClassifyError::ParsingError(e.to_string())),
        }?;
        debug!(
            "loaded {} image with {} sections, load bias 0x{:x}",
            image.architecture,
            image.sections.len(),
            image.load_bias
        );
        Ok(image)
    }
}
