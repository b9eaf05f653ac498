//! JSON and JSON Lines output formatters

use super::ReportFormatter;
use crate::survey::SiteReport;
use crate::ClassifyError;

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, reports: &[SiteReport]) -> Result<String, ClassifyError> {
        serde_json::to_string_pretty(reports).map_err(|e| ClassifyError::FormatError(e.to_string()))
    }
}

impl ReportFormatter for super::JsonLinesFormatter {
    fn format(&self, reports: &[SiteReport]) -> Result<String, ClassifyError> {
        let mut output = String::new();
        for report in reports {
            let line = serde_json::to_string(report).map_err(|e| ClassifyError::FormatError(e.to_string()))?;
            output.push_str(&line);
            output.push('\n');
        }
        Ok(output)
    }
}
