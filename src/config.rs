//! Session configuration for the classifiers.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::arch::RegisterMap;
use crate::{Architecture, ClassifyError};

/// How much the parser trusts the binary it is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Compiler-generated code
    #[default]
    Normal,
    /// The binary may be hand-crafted to defeat disassembly
    Defensive,
}

impl Mode {
    pub fn is_defensive(self) -> bool {
        self == Mode::Defensive
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Defensive => write!(f, "defensive"),
        }
    }
}

/// Target platform conventions that affect function entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Unix,
    /// Windows functions may start with a padding no-op
    Windows,
}

impl Platform {
    /// Padding instructions allowed before a function's frame-pointer save.
    pub fn entry_padding(self) -> usize {
        match self {
            Platform::Unix => 0,
            Platform::Windows => 1,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Unix => write!(f, "unix"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

/// Options chosen once per parsing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseConfig {
    pub mode: Mode,
    pub platform: Platform,
}

impl ParseConfig {
    pub fn new(mode: Mode, platform: Platform) -> Self {
        Self { mode, platform }
    }

    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ClassifyError> {
        serde_json::from_str(text).map_err(|e| ClassifyError::ConfigError(e.to_string()))
    }

    /// Register roles for `arch` under this configuration.
    pub fn register_map(&self, arch: Architecture) -> Result<RegisterMap, ClassifyError> {
        RegisterMap::for_platform(arch, self.platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ParseConfig::default();
        assert_eq!(config.mode, Mode::Normal);
        assert_eq!(config.platform, Platform::Unix);
        assert!(!config.mode.is_defensive());
    }

    #[test]
    fn test_from_json() {
        let config = ParseConfig::from_json(r#"{"mode": "defensive", "platform": "windows"}"#).unwrap();
        assert_eq!(config, ParseConfig::new(Mode::Defensive, Platform::Windows));

        let partial = ParseConfig::from_json(r#"{"mode": "defensive"}"#).unwrap();
        assert_eq!(partial.platform, Platform::Unix);
    }

    #[test]
    fn test_from_json_rejects_unknown_mode() {
        let err = ParseConfig::from_json(r#"{"mode": "paranoid"}"#).unwrap_err();
        assert!(matches!(err, ClassifyError::ConfigError(_)));
    }

    #[test]
    fn test_register_map_padding() {
        let config = ParseConfig::new(Mode::Normal, Platform::Windows);
        let regs = config.register_map(Architecture::X86_32).unwrap();
        assert_eq!(regs.entry_padding(), 1);
    }

    #[test]
    fn test_value_enum_names() {
        assert_eq!(Mode::from_str("defensive", true).unwrap(), Mode::Defensive);
        assert_eq!(Platform::Windows.to_string(), "windows");
    }
}
