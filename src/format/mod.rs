//! Output formats for survey reports

mod csv;
mod json;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::survey::SiteReport;
use crate::ClassifyError;

/// Supported output formats for survey results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    #[default]
    Text,
    /// JSON array
    Json,
    /// JSON Lines format (one JSON object per line)
    #[value(name = "jsonl")]
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get a formatter for this output format
    pub fn formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for survey output
pub trait ReportFormatter {
    fn format(&self, reports: &[SiteReport]) -> Result<String, ClassifyError>;
}

/// Format reports as aligned text, one site per line
pub struct TextFormatter;

/// Format reports as a JSON array
pub struct JsonFormatter;

/// Format reports in JSON Lines
pub struct JsonLinesFormatter;

/// Format reports in CSV
pub struct CsvFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, reports: &[SiteReport]) -> Result<String, ClassifyError> {
        let mut output = String::new();
        for report in reports {
            let mut verdicts = Vec::new();
            if report.thunk == Some(true) {
                verdicts.push("thunk".to_string());
            }
            if report.fake_call == Some(true) {
                verdicts.push("fake-call".to_string());
            }
            if let Some(name) = &report.import {
                verdicts.push(format!("import:{}", name));
            }
            if report.nop_jump == Some(true) {
                verdicts.push("nop-jump".to_string());
            }
            if report.cleans_stack == Some(true) {
                verdicts.push("cleans-stack".to_string());
            }
            let line = format!("0x{:08x}: {:<30} {}", report.address, report.text, verdicts.join(" "));
            output.push_str(line.trim_end());
            output.push('\n');
        }
        Ok(output)
    }
}
