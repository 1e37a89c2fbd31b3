//! In-memory mailbox used by tests and dry runs.
//!
//! Every mutating call is recorded so callers can assert exactly which
//! mailbox operations a cycle performed.

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{MailLabel, MailMessage, MailThread, Mailbox};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxCall {
    ListInboxThreadsSince(i64),
    GetOrCreateLabel(String),
    ArchiveThread(String),
    AttachLabel { thread_id: String, label: String },
    Refresh(String),
}

#[derive(Debug, Clone)]
struct StoredThread {
    id: String,
    messages: Vec<MailMessage>,
    labels: Vec<String>,
    in_inbox: bool,
}

impl StoredThread {
    fn last_activity_ms(&self) -> i64 {
        self.messages
            .iter()
            .map(|m| m.date_ms)
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct State {
    threads: Vec<StoredThread>,
    labels: Vec<MailLabel>,
    calls: Vec<MailboxCall>,
    fail_listing: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryMailbox {
    state: Mutex<State>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an inbox thread; its last activity is the newest message date.
    pub fn add_thread(&self, id: &str, messages: Vec<MailMessage>) {
        self.lock().threads.push(StoredThread {
            id: id.to_string(),
            messages,
            labels: Vec::new(),
            in_inbox: true,
        });
    }

    pub fn add_label(&self, name: &str) -> MailLabel {
        let mut state = self.lock();
        let label = MailLabel {
            id: format!("Label_{}", state.labels.len() + 1),
            name: name.to_string(),
        };
        state.labels.push(label.clone());
        label
    }

    /// Makes every subsequent listing call fail, as a broken store would.
    pub fn fail_listing(&self) {
        self.lock().fail_listing = true;
    }

    pub fn calls(&self) -> Vec<MailboxCall> {
        self.lock().calls.clone()
    }

    pub fn labels(&self) -> Vec<MailLabel> {
        self.lock().labels.clone()
    }

    pub fn thread_labels(&self, thread_id: &str) -> Vec<String> {
        self.lock()
            .threads
            .iter()
            .find(|t| t.id == thread_id)
            .map(|t| t.labels.clone())
            .unwrap_or_default()
    }

    pub fn is_in_inbox(&self, thread_id: &str) -> bool {
        self.lock()
            .threads
            .iter()
            .any(|t| t.id == thread_id && t.in_inbox)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the data is
        // still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn thread_mut<'s>(state: &'s mut State, thread_id: &str) -> Result<&'s mut StoredThread> {
    state
        .threads
        .iter_mut()
        .find(|t| t.id == thread_id)
        .ok_or_else(|| anyhow!("thread not found: {thread_id}"))
}

#[async_trait(?Send)]
impl Mailbox for InMemoryMailbox {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_inbox_threads_since(&self, since_ms: i64) -> Result<Vec<MailThread>> {
        let mut state = self.lock();
        state.calls.push(MailboxCall::ListInboxThreadsSince(since_ms));
        if state.fail_listing {
            bail!("mailbox listing unavailable");
        }

        Ok(state
            .threads
            .iter()
            .filter(|t| t.in_inbox && t.last_activity_ms() > since_ms)
            .map(|t| MailThread {
                id: t.id.clone(),
                last_activity_ms: t.last_activity_ms(),
            })
            .collect())
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<MailMessage>> {
        let mut state = self.lock();
        Ok(thread_mut(&mut state, thread_id)?.messages.clone())
    }

    async fn get_or_create_label(&self, name: &str) -> Result<MailLabel> {
        let existing = {
            let mut state = self.lock();
            state
                .calls
                .push(MailboxCall::GetOrCreateLabel(name.to_string()));
            state.labels.iter().find(|l| l.name == name).cloned()
        };
        match existing {
            Some(label) => Ok(label),
            None => Ok(self.add_label(name)),
        }
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .calls
            .push(MailboxCall::ArchiveThread(thread_id.to_string()));
        thread_mut(&mut state, thread_id)?.in_inbox = false;
        Ok(())
    }

    async fn attach_label(&self, thread_id: &str, label: &MailLabel) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MailboxCall::AttachLabel {
            thread_id: thread_id.to_string(),
            label: label.name.clone(),
        });
        let thread = thread_mut(&mut state, thread_id)?;
        if !thread.labels.contains(&label.name) {
            thread.labels.push(label.name.clone());
        }
        Ok(())
    }

    async fn refresh(&self, thread_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MailboxCall::Refresh(thread_id.to_string()));
        thread_mut(&mut state, thread_id)?;
        Ok(())
    }
}
