use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod gmail_api;
pub mod memory;

pub use gmail_api::GmailMailbox;
pub use memory::InMemoryMailbox;

/// Snapshot of an inbox thread taken once per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailThread {
    pub id: String,
    /// Millisecond timestamp of the newest message in the thread.
    pub last_activity_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub date_ms: i64,
    pub subject: String,
    pub plain_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailLabel {
    pub id: String,
    pub name: String,
}

/// The mailbox store the cycle reads threads from and labels threads in.
#[async_trait(?Send)]
pub trait Mailbox {
    fn name(&self) -> &str;

    /// Inbox threads whose last activity is strictly after `since_ms`, in
    /// the store's retrieval order.
    async fn list_inbox_threads_since(&self, since_ms: i64) -> Result<Vec<MailThread>>;

    /// Messages of a thread in retrieval order.
    async fn get_messages(&self, thread_id: &str) -> Result<Vec<MailMessage>>;

    /// Looks a user label up by name, creating it when absent.
    async fn get_or_create_label(&self, name: &str) -> Result<MailLabel>;

    async fn archive_thread(&self, thread_id: &str) -> Result<()>;

    async fn attach_label(&self, thread_id: &str, label: &MailLabel) -> Result<()>;

    async fn refresh(&self, thread_id: &str) -> Result<()>;
}
