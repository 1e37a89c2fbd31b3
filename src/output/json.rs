use anyhow::Result;

use crate::config::LabelDescriptor;
use crate::db::models::Trigger;
use crate::output::WatermarkView;
use crate::triage::CycleReport;

pub fn format_report(report: &CycleReport) -> Result<String> {
    let mut value = serde_json::to_value(report)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("summary".to_string(), report.summary().into());
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

pub fn format_triggers(triggers: &[Trigger]) -> Result<String> {
    Ok(serde_json::to_string_pretty(triggers)?)
}

pub fn format_watermark(view: &WatermarkView) -> Result<String> {
    Ok(serde_json::to_string_pretty(view)?)
}

pub fn format_labels(labels: &[LabelDescriptor]) -> Result<String> {
    Ok(serde_json::to_string_pretty(labels)?)
}
