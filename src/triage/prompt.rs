//! Renders the classification instruction for one batch.
//!
//! The prompt embeds the batch, the label set and three JSON schemas inline.
//! The one-label-per-thread and equal-length rules are stated to the service
//! only; nothing here enforces them.

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::config::LabelDescriptor;

use super::fetcher::TriageThread;

fn messages_schema() -> Value {
    json!({
        "description": "Email threads, each with its thread id and latest message body.",
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "threadId": {"description": "Mailbox thread id.", "type": "string"},
                "message": {"description": "Plain-text message body.", "type": "string"}
            }
        }
    })
}

fn labels_schema() -> Value {
    json!({
        "description": "Available labels and what each one is for.",
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "label": {"description": "Label name.", "type": "string"},
                "description": {"description": "What the label covers.", "type": "string"}
            }
        }
    })
}

fn results_schema() -> Value {
    json!({
        "description": "One chosen label name per thread of \"Array1\".",
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "label": {"description": "Chosen label name.", "type": "string"},
                "threadId": {"description": "Mailbox thread id.", "type": "string"}
            }
        }
    })
}

pub fn render(labels: &[LabelDescriptor], batch: &[TriageThread]) -> Result<String> {
    let messages = serde_json::to_string(batch).context("encode batch for prompt")?;
    let labels = serde_json::to_string(labels).context("encode labels for prompt")?;

    let lines = [
        "Carry out the steps below in order.".to_string(),
        "1. Read the email messages in the JSON array \"Array1\".".to_string(),
        format!("<Array1>{messages}</Array1>"),
        "\"Array1\" follows the JSON schema \"JsonSchema1\".".to_string(),
        format!("<JsonSchema1>{}</JsonSchema1>", messages_schema()),
        "2. Read the labels in the JSON array \"Array2\".".to_string(),
        format!("<Array2>{labels}</Array2>"),
        "\"Array2\" follows the JSON schema \"JsonSchema2\".".to_string(),
        format!("<JsonSchema2>{}</JsonSchema2>", labels_schema()),
        "3. For every element of \"Array1\", pick the one label from \"Array2\" most strongly related to its message."
            .to_string(),
        "Return the result as JSON matching the schema \"JsonSchema3\".".to_string(),
        format!("<JsonSchema3>{}</JsonSchema3>", results_schema()),
        "<IMPORTANT>".to_string(),
        "- Each element of \"Array1\" gets exactly one label name.".to_string(),
        "- The output array has the same length as \"Array1\".".to_string(),
        "</IMPORTANT>".to_string(),
    ];
    Ok(lines.join("\n"))
}
