pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::config::LabelDescriptor;
use crate::db::models::Trigger;
use crate::triage::CycleReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// The stored watermark as shown by `watermark show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatermarkView {
    pub key: String,
    pub value_ms: Option<i64>,
    pub updated_at: Option<String>,
}

pub fn format_report(format: OutputFormat, report: &CycleReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_report(report)),
        OutputFormat::Json => json::format_report(report),
    }
}

pub fn format_triggers(format: OutputFormat, triggers: &[Trigger]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_triggers(triggers)),
        OutputFormat::Json => json::format_triggers(triggers),
    }
}

pub fn format_watermark(format: OutputFormat, view: &WatermarkView) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_watermark(view)),
        OutputFormat::Json => json::format_watermark(view),
    }
}

pub fn format_labels(format: OutputFormat, labels: &[LabelDescriptor]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_labels(labels)),
        OutputFormat::Json => json::format_labels(labels),
    }
}
