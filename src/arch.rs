//! Per-architecture register roles.
//!
//! Every classifier is parameterised by a [`RegisterMap`] chosen once per
//! parsing session instead of by compile-time platform switches.

use crate::config::Platform;
use crate::insn::Register;
use crate::{Architecture, ClassifyError};

/// Stack and frame pointer identity, address width, and entry padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    architecture: Architecture,
    stack_pointer: Register,
    frame_pointer: Register,
    address_width: u8,
    entry_padding: usize,
}

impl RegisterMap {
    /// Register roles for `arch`, with no entry padding.
    pub fn for_architecture(arch: Architecture) -> Result<Self, ClassifyError> {
        let (stack_pointer, frame_pointer, address_width) = match arch {
            Architecture::X86_32 => (Register::ESP, Register::EBP, 4),
            Architecture::X86_64 => (Register::RSP, Register::RBP, 8),
            _ => return Err(ClassifyError::UnsupportedArchitecture(arch)),
        };
        Ok(Self {
            architecture: arch,
            stack_pointer,
            frame_pointer,
            address_width,
            entry_padding: 0,
        })
    }

    /// Register roles for `arch` on `platform`.
    pub fn for_platform(arch: Architecture, platform: Platform) -> Result<Self, ClassifyError> {
        Ok(Self::for_architecture(arch)?.with_entry_padding(platform.entry_padding()))
    }

    /// Number of padding instructions a function entry may start with.
    pub fn with_entry_padding(mut self, padding: usize) -> Self {
        self.entry_padding = padding;
        self
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn stack_pointer(&self) -> Register {
        self.stack_pointer
    }

    pub fn frame_pointer(&self) -> Register {
        self.frame_pointer
    }

    /// Address width in bytes
    pub fn address_width(&self) -> u8 {
        self.address_width
    }

    pub fn entry_padding(&self) -> usize {
        self.entry_padding
    }

    /// How many instructions after a frame-pointer save may hold the
    /// `mov fp, sp` that completes a frame preamble.
    pub fn preamble_window(&self) -> usize {
        2 + self.entry_padding
    }
}
