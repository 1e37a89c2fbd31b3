use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::classifier::TokenUsage;
use crate::config::INBOX_LABEL;
use crate::connectors::Mailbox;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub labeled: usize,
    pub left_in_inbox: usize,
    pub malformed: usize,
}

/// Applies an accepted classifier result to the mailbox. Entries labeled
/// INBOX, or with no label, are left alone. Every other entry archives its
/// thread and attaches the label, exactly once per entry.
pub async fn apply_results(
    mailbox: &dyn Mailbox,
    entries: &[Value],
    usage: TokenUsage,
) -> Result<ApplyStats> {
    let mut stats = ApplyStats::default();

    for entry in entries {
        let label = entry.get("label").and_then(Value::as_str);
        let Some(label) = label.filter(|l| !l.is_empty() && *l != INBOX_LABEL) else {
            stats.left_in_inbox += 1;
            continue;
        };
        let Some(thread_id) = entry.get("threadId").and_then(Value::as_str) else {
            warn!(%entry, "classifier entry has no thread id; skipping");
            stats.malformed += 1;
            continue;
        };

        let subject = mailbox
            .get_messages(thread_id)
            .await
            .with_context(|| format!("read thread {thread_id}"))?
            .into_iter()
            .next()
            .map(|m| m.subject)
            .unwrap_or_default();
        info!(thread_id, subject = %subject, label, "labeling thread");
        info!(total_tokens = usage.total_tokens, "classifier token usage");

        let mail_label = mailbox
            .get_or_create_label(label)
            .await
            .with_context(|| format!("get or create label {label}"))?;
        mailbox
            .archive_thread(thread_id)
            .await
            .with_context(|| format!("archive thread {thread_id}"))?;
        mailbox
            .attach_label(thread_id, &mail_label)
            .await
            .with_context(|| format!("attach label {label} to {thread_id}"))?;
        mailbox
            .refresh(thread_id)
            .await
            .with_context(|| format!("refresh thread {thread_id}"))?;

        stats.labeled += 1;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{apply_results, ApplyStats};
    use crate::classifier::TokenUsage;
    use crate::connectors::memory::MailboxCall;
    use crate::connectors::{InMemoryMailbox, MailMessage};

    fn mailbox_with(ids: &[&str]) -> InMemoryMailbox {
        let mailbox = InMemoryMailbox::new();
        for (i, id) in ids.iter().enumerate() {
            mailbox.add_thread(
                id,
                vec![MailMessage {
                    id: format!("m{i}"),
                    date_ms: 1_000 + i as i64,
                    subject: format!("About {id}"),
                    plain_body: String::new(),
                }],
            );
        }
        mailbox
    }

    fn mutations(mailbox: &InMemoryMailbox) -> Vec<MailboxCall> {
        mailbox
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, MailboxCall::ListInboxThreadsSince(_)))
            .collect()
    }

    #[tokio::test]
    async fn real_label_runs_full_sequence_once() {
        let mailbox = mailbox_with(&["A"]);
        let stats = apply_results(
            &mailbox,
            &[json!({"threadId": "A", "label": "academic"})],
            TokenUsage::default(),
        )
        .await
        .expect("apply");

        assert_eq!(stats.labeled, 1);
        assert_eq!(
            mutations(&mailbox),
            vec![
                MailboxCall::GetOrCreateLabel("academic".to_string()),
                MailboxCall::ArchiveThread("A".to_string()),
                MailboxCall::AttachLabel {
                    thread_id: "A".to_string(),
                    label: "academic".to_string()
                },
                MailboxCall::Refresh("A".to_string()),
            ]
        );
        assert!(!mailbox.is_in_inbox("A"));
        assert_eq!(mailbox.thread_labels("A"), vec!["academic".to_string()]);
    }

    #[tokio::test]
    async fn inbox_and_missing_labels_touch_nothing() {
        let mailbox = mailbox_with(&["A", "B", "C"]);
        let stats = apply_results(
            &mailbox,
            &[
                json!({"threadId": "A", "label": "INBOX"}),
                json!({"threadId": "B"}),
                json!({"threadId": "C", "label": ""}),
            ],
            TokenUsage::default(),
        )
        .await
        .expect("apply");

        assert_eq!(
            stats,
            ApplyStats {
                labeled: 0,
                left_in_inbox: 3,
                malformed: 0
            }
        );
        assert!(mutations(&mailbox).is_empty());
        assert!(mailbox.is_in_inbox("A"));
    }

    #[tokio::test]
    async fn existing_label_is_reused() {
        let mailbox = mailbox_with(&["A", "B"]);
        mailbox.add_label("academic");
        apply_results(
            &mailbox,
            &[
                json!({"threadId": "A", "label": "academic"}),
                json!({"threadId": "B", "label": "academic"}),
            ],
            TokenUsage::default(),
        )
        .await
        .expect("apply");

        assert_eq!(mailbox.labels().len(), 1);
    }

    #[tokio::test]
    async fn entries_without_thread_id_are_skipped() {
        let mailbox = mailbox_with(&["A"]);
        let stats = apply_results(
            &mailbox,
            &[json!({"label": "academic"}), json!(42)],
            TokenUsage::default(),
        )
        .await
        .expect("apply");

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.left_in_inbox, 1);
        assert!(mutations(&mailbox).is_empty());
    }

    #[tokio::test]
    async fn unknown_thread_aborts() {
        let mailbox = mailbox_with(&["A"]);
        let result = apply_results(
            &mailbox,
            &[json!({"threadId": "Z", "label": "academic"})],
            TokenUsage::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
