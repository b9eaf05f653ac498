//! CSV output formatter

use super::ReportFormatter;
use crate::survey::SiteReport;
use crate::ClassifyError;

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, reports: &[SiteReport]) -> Result<String, ClassifyError> {
        let mut writer = ::csv::Writer::from_writer(Vec::new());
        for report in reports {
            writer
                .serialize(report)
                .map_err(|e| ClassifyError::FormatError(e.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ClassifyError::FormatError(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| ClassifyError::FormatError(e.to_string()))
    }
}
