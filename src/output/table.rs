use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::config::LabelDescriptor;
use crate::db::models::Trigger;
use crate::output::WatermarkView;
use crate::triage::CycleReport;

const LABEL_WIDTH: usize = 20;
const DESCRIPTION_WIDTH: usize = 56;
const HANDLER_WIDTH: usize = 24;

pub fn format_report(report: &CycleReport) -> String {
    let mut out = String::new();
    out.push_str(&report.summary());
    out.push('\n');

    if report.batches.is_empty() {
        return out;
    }

    out.push('\n');
    out.push_str("Batch  Threads  Result     Labeled  Inbox  Tokens\n");
    out.push_str("-----  -------  ---------  -------  -----  --------\n");
    for batch in &report.batches {
        let result = if batch.accepted() { "accepted" } else { "rejected" };
        out.push_str(&format!(
            "{:>5}  {:>7}  {:<9}  {:>7}  {:>5}  {:>8}\n",
            batch.index + 1,
            batch.threads,
            result,
            batch.stats.labeled,
            batch.stats.left_in_inbox,
            batch.total_tokens
        ));
    }

    out.push('\n');
    out.push_str(&format!(
        "Labeled: {}  Left in inbox: {}  Failed batches: {}  Tokens: {}\n",
        report.labeled, report.left_in_inbox, report.failed_batches, report.total_tokens
    ));
    out.push_str(&format!(
        "Next cycle: {} ({})\n",
        report.trigger.next_fire_at().to_rfc3339_opts(SecondsFormat::Secs, true),
        relative_time(report.trigger.next_fire_at(), Utc::now())
    ));
    out
}

pub fn format_triggers(triggers: &[Trigger]) -> String {
    if triggers.is_empty() {
        return "No triggers registered.".to_string();
    }

    let now = Utc::now();
    let mut out = String::new();
    out.push_str(&format!(
        "{:>4}  {:<handler$}  {:>7}  Next fire\n",
        "ID",
        "Handler",
        "Every",
        handler = HANDLER_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(4),
        "-".repeat(HANDLER_WIDTH),
        "-".repeat(7),
        "-".repeat(20)
    ));
    for trigger in triggers {
        out.push_str(&format!(
            "{:>4}  {:<handler$}  {:>7}  {}\n",
            trigger.id,
            truncate_for_width(&trigger.handler_name, HANDLER_WIDTH),
            format!("{}m", trigger.interval_minutes),
            relative_time(trigger.next_fire_at(), now),
            handler = HANDLER_WIDTH
        ));
    }
    out
}

pub fn format_watermark(view: &WatermarkView) -> String {
    let Some(ms) = view.value_ms else {
        return format!(
            "Watermark '{}' is not set; the next cycle looks back one hour.",
            view.key
        );
    };

    let mut out = format!("Watermark: {ms}");
    if let Some(at) = Utc.timestamp_millis_opt(ms).single() {
        out.push_str(&format!(
            " ({}, {})",
            at.to_rfc3339_opts(SecondsFormat::Millis, true),
            relative_time(at, Utc::now())
        ));
    }
    out.push('\n');
    if let Some(updated_at) = &view.updated_at {
        out.push_str(&format!("Updated:   {updated_at}\n"));
    }
    out
}

pub fn format_labels(labels: &[LabelDescriptor]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<label$}  Description\n",
        "Label",
        label = LABEL_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}\n",
        "-".repeat(LABEL_WIDTH),
        "-".repeat(DESCRIPTION_WIDTH)
    ));
    for label in labels {
        let name = truncate_for_width(&label.name, LABEL_WIDTH);
        out.push_str(&pad_to_width(&name, LABEL_WIDTH));
        out.push_str("  ");
        out.push_str(&truncate_for_width(&label.description, DESCRIPTION_WIDTH));
        out.push('\n');
    }
    out
}

fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = at.signed_duration_since(now);
    let (minutes, future) = if delta.num_seconds() >= 0 {
        (delta.num_minutes(), true)
    } else {
        (-delta.num_minutes(), false)
    };

    if minutes < 1 {
        return if future { "due now" } else { "just now" }.to_string();
    }
    if minutes >= 24 * 60 {
        return at.format("%Y-%m-%d").to_string();
    }

    let amount = if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h", minutes / 60)
    };
    if future {
        format!("in {amount}")
    } else {
        format!("{amount} ago")
    }
}

fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(current)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
