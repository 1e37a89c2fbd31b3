use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::connectors::{MailMessage, Mailbox};

/// A thread as seen by the classifier: its id and newest message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageThread {
    #[serde(rename = "threadId")]
    pub id: String,
    #[serde(skip)]
    pub last_activity_ms: i64,
    #[serde(rename = "message")]
    pub latest_message_body: String,
}

/// Inbox threads active strictly after `since_ms`, in retrieval order, each
/// paired with the body of the message dated at the thread's last activity.
pub async fn fetch_threads(mailbox: &dyn Mailbox, since_ms: i64) -> Result<Vec<TriageThread>> {
    let listed = mailbox
        .list_inbox_threads_since(since_ms)
        .await
        .with_context(|| format!("list inbox threads since {since_ms} via {}", mailbox.name()))?;

    let mut threads = Vec::with_capacity(listed.len());
    for thread in listed.into_iter().filter(|t| t.last_activity_ms > since_ms) {
        let messages = mailbox
            .get_messages(&thread.id)
            .await
            .with_context(|| format!("read messages of thread {}", thread.id))?;
        let body = latest_message(&messages, thread.last_activity_ms, &thread.id)
            .map(|m| m.plain_body.clone())
            .unwrap_or_default();

        threads.push(TriageThread {
            id: thread.id,
            last_activity_ms: thread.last_activity_ms,
            latest_message_body: body,
        });
    }

    debug!(count = threads.len(), since_ms, "fetched inbox threads");
    Ok(threads)
}

/// The first message whose date equals `last_activity_ms`. When none matches
/// the newest message stands in.
fn latest_message<'m>(
    messages: &'m [MailMessage],
    last_activity_ms: i64,
    thread_id: &str,
) -> Option<&'m MailMessage> {
    if let Some(exact) = messages.iter().find(|m| m.date_ms == last_activity_ms) {
        return Some(exact);
    }

    warn!(
        thread_id,
        last_activity_ms, "no message matches the thread's last activity; using the newest"
    );
    messages.iter().max_by_key(|m| m.date_ms)
}
