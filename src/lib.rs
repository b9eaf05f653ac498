//! Core IR, traits, and error types for the Tailspin instruction classifiers.
//!
//! Tailspin answers the semantic questions a CFG recovery engine asks while it
//! walks a block: is this instruction a no-op, is this jump really a tail call,
//! is this call a fake call used to redirect control flow, does this indirect
//! call go through an import table, does this sequence build a stack frame.
//! Decoding is delegated to a [`Decoder`], byte access to an
//! [`space::AddressSpace`], and graph lookups to a [`cfg::CfgStore`].
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::collections::HashSet;
//! use tailspin::{
//!     cfg::{Block, Cfg, EdgeType, Function},
//!     classify::{Classifier, ParseContext},
//!     config::ParseConfig,
//!     decoder::CapstoneDecoder,
//!     parser::GoblinParser,
//!     BinaryParser, // Import the trait to bring parse_file() into scope
//! };
//!
//! let image = GoblinParser::new().parse_file("path/to/binary").unwrap();
//! let decoder = CapstoneDecoder::for_architecture(image.architecture).unwrap();
//! let regs = ParseConfig::default().register_map(image.architecture).unwrap();
//! let region = image.code_regions()[0];
//! let cfg = Cfg::new();
//!
//! let ctx = ParseContext::new(&decoder, &image, &cfg, region, &regs, ParseConfig::default().mode);
//! let mut site = Classifier::at(ctx, region.start, Block::new(region.start, region.end)).unwrap();
//!
//! let function = Function::new(region.start);
//! if site.is_tail_call(&function, EdgeType::Direct, &HashSet::new()) {
//!     println!("0x{:x} leaves the function", region.start);
//! }
//! ```

pub mod arch;
pub mod cfg;
pub mod classify;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod expr;
pub mod format;
pub mod insn;
pub mod parser;
pub mod space;
pub mod stack;
pub mod survey;
#[cfg(test)]
mod fixtures;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

pub use arch::RegisterMap;
pub use insn::{Category, Insn, Operand, Operation, RegKind, Register};

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Decoder trait: architecture-specific disassembler.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction located at `addr`.
    ///
    /// # Arguments
    /// * `bytes` - Bytes starting at `addr`; the decoder never reads past the end
    /// * `addr` - Address of the first byte
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise
    fn decode(&self, bytes: &[u8], addr: Address) -> Option<Insn>;

    /// Architecture this decoder understands
    fn architecture(&self) -> Architecture;
}

/// Supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// Unknown architecture
    Unknown,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Parser trait: turn raw file bytes into a [`space::MappedImage`].
pub trait BinaryParser: Send + Sync {
    /// Parse binary data into a mapped image
    ///
    /// # Arguments
    /// * `data` - The binary data to parse
    ///
    /// # Returns
    /// Result containing the MappedImage if parsing was successful
    fn parse(&self, data: &[u8]) -> Result<space::MappedImage, ClassifyError>;

    /// Read `path` from disk and parse it
    fn parse_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<space::MappedImage, ClassifyError>
    where
        Self: Sized,
    {
        let data = std::fs::read(path)?;
        self.parse(&data)
    }
}

/// Error type for set-up and reporting operations.
///
/// The classifiers themselves never fail: every predicate resolves to a
/// definite answer. Errors only come from building the collaborators around
/// them.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// Decoder error
    #[error("Decoder error: {0}")]
    DecoderError(#[from] decoder::DecoderError),

    /// Unsupported architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),

    /// Invalid configuration document
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Report serialization failed
    #[error("Format error: {0}")]
    FormatError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_display() {
        assert_eq!(Architecture::X86_32.to_string(), "x86-32");
        assert_eq!(Architecture::X86_64.to_string(), "x86-64");
    }

    #[test]
    fn test_error_messages() {
        let err = ClassifyError::UnsupportedArchitecture(Architecture::Arm);
        assert_eq!(err.to_string(), "Unsupported architecture: ARM");

        let err = ClassifyError::ParsingError("bad magic".into());
        assert_eq!(err.to_string(), "Failed to parse binary format: bad magic");
    }
}
