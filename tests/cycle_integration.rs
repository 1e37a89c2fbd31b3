use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use triage::classifier::{ClassificationRequest, Classifier, ClassifierOutput, TokenUsage};
use triage::config::{LabelDescriptor, RawConfig, TriageConfig};
use triage::connectors::memory::MailboxCall;
use triage::connectors::{InMemoryMailbox, MailMessage};
use triage::db::Database;
use triage::memory::MemoryStore;
use triage::triage::{
    run_cycle, CycleError, KeyValueStore, TriageCycle, TriggerService, WATERMARK_KEY,
};

struct ScriptedClassifier {
    replies: Mutex<VecDeque<Result<ClassifierOutput>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    fn new(replies: Vec<Result<ClassifierOutput>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait(?Send)]
impl Classifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<ClassifierOutput> {
        assert_eq!(request.response_mime_type, "application/json");
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        match self.replies.lock().expect("replies lock").pop_front() {
            Some(reply) => reply,
            None => bail!("no scripted reply left"),
        }
    }
}

fn reply(value: Option<Value>) -> Result<ClassifierOutput> {
    Ok(ClassifierOutput {
        parsed_result: value,
        token_usage: TokenUsage {
            prompt_tokens: 90,
            candidate_tokens: 10,
            total_tokens: 100,
        },
    })
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 9, 30, 0).unwrap()
}

fn raw_config(batch_size: usize) -> RawConfig {
    RawConfig {
        handler_name: Some("main".to_string()),
        api_key: Some("test-key".to_string()),
        labels: Some(vec![LabelDescriptor::new(
            "academic",
            "Related to university and research",
        )]),
        batch_size: Some(batch_size),
        ..RawConfig::default()
    }
}

fn config(batch_size: usize) -> TriageConfig {
    TriageConfig::from_raw(raw_config(batch_size)).expect("valid config")
}

fn message(id: &str, at: DateTime<Utc>, subject: &str, body: &str) -> MailMessage {
    MailMessage {
        id: id.to_string(),
        date_ms: at.timestamp_millis(),
        subject: subject.to_string(),
        plain_body: body.to_string(),
    }
}

/// Inbox threads `T0..Tn` active within the last hour.
fn mailbox_with_threads(count: usize) -> InMemoryMailbox {
    let mailbox = InMemoryMailbox::new();
    for i in 0..count {
        let at = now() - Duration::minutes(50 - i as i64);
        mailbox.add_thread(
            &format!("T{i}"),
            vec![message(&format!("m{i}"), at, &format!("Subject {i}"), &format!("Body {i}"))],
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

fn stored_watermark(store: &dyn KeyValueStore) -> Option<String> {
    store.get(WATERMARK_KEY).expect("read watermark")
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("triage-cycle-it-{}.db", Uuid::new_v4()))
}

#[tokio::test]
async fn labels_academic_thread_and_leaves_inbox_thread() {
    let mailbox = InMemoryMailbox::new();
    mailbox.add_thread(
        "A",
        vec![message(
            "a1",
            now() - Duration::minutes(20),
            "Seminar schedule",
            "The research seminar moves to room 4.",
        )],
    );
    mailbox.add_thread(
        "B",
        vec![message(
            "b1",
            now() - Duration::minutes(10),
            "Lunch?",
            "Are you free for lunch?",
        )],
    );
    let classifier = ScriptedClassifier::new(vec![reply(Some(json!([
        {"threadId": "A", "label": "academic"},
        {"threadId": "B", "label": "INBOX"}
    ])))]);
    let store = MemoryStore::new();
    let config = config(5);

    let report = TriageCycle::new(&config, &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("cycle");

    assert_eq!(
        report.summary(),
        format!(
            "{}: 2 mails were processed.",
            now().to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    );
    assert_eq!(report.summary(), "2026-04-01T09:30:00.000Z: 2 mails were processed.");
    assert_eq!(report.labeled, 1);
    assert_eq!(report.left_in_inbox, 1);
    assert_eq!(report.total_tokens, 100);

    assert!(!mailbox.is_in_inbox("A"));
    assert_eq!(mailbox.thread_labels("A"), vec!["academic".to_string()]);
    assert!(mailbox.is_in_inbox("B"));
    assert!(mailbox.thread_labels("B").is_empty());
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

    let prompts = classifier.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("The research seminar moves to room 4."));
    assert!(prompts[0].contains("\"label\":\"INBOX\""));

    assert_eq!(
        stored_watermark(&store),
        Some(now().timestamp_millis().to_string())
    );
    let triggers = store.list_triggers().expect("triggers");
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].handler_name, "main");
    assert_eq!(triggers[0].interval_minutes, 10);
}

#[tokio::test]
async fn empty_watermark_looks_back_one_hour() {
    let mailbox = mailbox_with_threads(0);
    let classifier = ScriptedClassifier::new(Vec::new());
    let store = MemoryStore::new();
    let config = config(5);

    let report = TriageCycle::new(&config, &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("cycle");

    let expected_since = now().timestamp_millis() - 3_600_000;
    assert_eq!(
        mailbox.calls(),
        vec![MailboxCall::ListInboxThreadsSince(expected_since)]
    );
    assert_eq!(report.since_ms, expected_since);
    assert_eq!(report.processed, 0);
    assert!(report.batches.is_empty());
    assert!(classifier.prompts().is_empty());
    assert_eq!(
        stored_watermark(&store),
        Some(now().timestamp_millis().to_string())
    );
    assert_eq!(store.list_triggers().expect("triggers").len(), 1);
}

#[tokio::test]
async fn threads_at_or_before_watermark_are_skipped() {
    let mailbox = InMemoryMailbox::new();
    let boundary = now() - Duration::minutes(30);
    mailbox.add_thread("old", vec![message("m0", boundary, "Old", "seen")]);
    mailbox.add_thread(
        "new",
        vec![message("m1", boundary + Duration::milliseconds(1), "New", "fresh")],
    );
    let classifier =
        ScriptedClassifier::new(vec![reply(Some(json!([{"threadId": "new", "label": "INBOX"}])))]);
    let store = MemoryStore::new();
    store
        .set(WATERMARK_KEY, &boundary.timestamp_millis().to_string())
        .expect("seed watermark");

    let report = TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("cycle");

    assert_eq!(report.processed, 1);
    assert!(classifier.prompts()[0].contains("fresh"));
    assert!(!classifier.prompts()[0].contains("seen"));
}

#[tokio::test]
async fn null_result_restores_pre_cycle_watermark() {
    let mailbox = mailbox_with_threads(2);
    let classifier = ScriptedClassifier::new(vec![reply(None)]);
    let store = MemoryStore::new();
    let previous = (now() - Duration::hours(2)).timestamp_millis();
    store
        .set(WATERMARK_KEY, &previous.to_string())
        .expect("seed watermark");

    let report = TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("rejected batch does not fail the cycle");

    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(stored_watermark(&store), Some(previous.to_string()));
    let writes: Vec<String> = store
        .writes()
        .into_iter()
        .filter(|(key, _)| key == WATERMARK_KEY)
        .map(|(_, value)| value)
        .collect();
    assert_eq!(
        writes,
        vec![
            previous.to_string(),
            now().timestamp_millis().to_string(),
            previous.to_string()
        ]
    );
    assert!(mutations(&mailbox).is_empty());
    assert_eq!(store.list_triggers().expect("triggers").len(), 1);
}

/// Collects formatted log lines so tests can assert on emitted events.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("log lock")).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn rejected_batch_logs_a_warning() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mailbox = mailbox_with_threads(2);
    let classifier = ScriptedClassifier::new(vec![reply(Some(json!("not an array")))]);
    let store = MemoryStore::new();

    let report = TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("rejected batch does not fail the cycle");
    assert_eq!(report.failed_batches, 1);

    let text = logs.text();
    let line = text
        .lines()
        .find(|line| line.contains("classifier returned an invalid value"))
        .expect("rejection warning emitted");
    assert!(line.contains("WARN"));
    assert!(line.contains("batch=1"));
    assert!(line.contains("result is not an array"));
}

#[tokio::test]
async fn rollback_of_defaulted_watermark_stores_the_default() {
    let mailbox = mailbox_with_threads(1);
    let classifier = ScriptedClassifier::new(vec![reply(Some(json!({"threadId": "T0"})))]);
    let store = MemoryStore::new();

    TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("cycle");

    assert_eq!(
        stored_watermark(&store),
        Some((now().timestamp_millis() - 3_600_000).to_string())
    );
}

#[tokio::test]
async fn any_rejected_batch_rolls_back_the_whole_cycle() {
    let mailbox = mailbox_with_threads(7);
    let first: Vec<Value> = (0..5)
        .map(|i| json!({"threadId": format!("T{i}"), "label": "academic"}))
        .collect();
    let classifier = ScriptedClassifier::new(vec![
        reply(Some(Value::Array(first))),
        reply(Some(json!("not json at all"))),
    ]);
    let store = MemoryStore::new();
    let config = config(5);

    let report = TriageCycle::new(&config, &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("cycle");

    assert_eq!(report.batches.len(), 2);
    assert_eq!(report.batches[0].threads, 5);
    assert_eq!(report.batches[1].threads, 2);
    assert!(report.batches[0].accepted());
    assert!(!report.batches[1].accepted());
    assert_eq!(report.labeled, 5);
    assert_eq!(report.summary(), "2026-04-01T09:30:00.000Z: 7 mails were processed.");

    for i in 0..5 {
        assert!(!mailbox.is_in_inbox(&format!("T{i}")));
    }
    assert!(mailbox.is_in_inbox("T5"));
    assert!(mailbox.is_in_inbox("T6"));
    assert_eq!(
        stored_watermark(&store),
        Some((now().timestamp_millis() - 3_600_000).to_string())
    );

    let prompts = classifier.prompts();
    assert!(prompts[0].contains("Body 4") && !prompts[0].contains("Body 5"));
    assert!(prompts[1].contains("Body 5") && prompts[1].contains("Body 6"));
}

#[tokio::test]
async fn each_labeled_thread_is_mutated_exactly_once() {
    let mailbox = mailbox_with_threads(3);
    let classifier = ScriptedClassifier::new(vec![reply(Some(json!([
        {"threadId": "T0", "label": "academic"},
        {"threadId": "T1", "label": "newsletter"},
        {"threadId": "T2", "label": "INBOX"}
    ])))]);
    let store = MemoryStore::new();

    TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await
        .expect("cycle");

    let calls = mutations(&mailbox);
    for thread in ["T0", "T1"] {
        let archived = calls
            .iter()
            .filter(|c| **c == MailboxCall::ArchiveThread(thread.to_string()))
            .count();
        let refreshed = calls
            .iter()
            .filter(|c| **c == MailboxCall::Refresh(thread.to_string()))
            .count();
        assert_eq!((archived, refreshed), (1, 1), "thread {thread}");
    }
    assert!(calls.iter().all(|c| match c {
        MailboxCall::ArchiveThread(id) | MailboxCall::Refresh(id) => id != "T2",
        MailboxCall::AttachLabel { thread_id, .. } => thread_id != "T2",
        _ => true,
    }));
    let names: Vec<String> = mailbox.labels().into_iter().map(|l| l.name).collect();
    assert_eq!(names, vec!["academic".to_string(), "newsletter".to_string()]);
}

#[tokio::test]
async fn configuration_error_touches_nothing() {
    let mailbox = mailbox_with_threads(2);
    let classifier = ScriptedClassifier::new(vec![reply(Some(json!([])))]);
    let store = MemoryStore::new();
    store.seed_trigger("main", 10);

    let mut raw = raw_config(5);
    raw.api_key = None;
    let result = run_cycle(raw, &mailbox, &classifier, &store, &store, now()).await;

    assert!(matches!(result, Err(CycleError::Config(_))));
    assert!(mailbox.calls().is_empty());
    assert!(classifier.prompts().is_empty());
    assert!(store.writes().is_empty());
    assert_eq!(store.list_triggers().expect("triggers").len(), 1);
}

#[tokio::test]
async fn missing_handler_and_labels_are_configuration_errors() {
    let mailbox = mailbox_with_threads(0);
    let classifier = ScriptedClassifier::new(Vec::new());
    let store = MemoryStore::new();

    let mut no_handler = raw_config(5);
    no_handler.handler_name = Some("  ".to_string());
    let mut no_labels = raw_config(5);
    no_labels.labels = None;

    for raw in [no_handler, no_labels] {
        let result = run_cycle(raw, &mailbox, &classifier, &store, &store, now()).await;
        assert!(matches!(result, Err(CycleError::Config(_))));
    }
    assert!(mailbox.calls().is_empty());
    assert!(store.list_triggers().expect("triggers").is_empty());
}

#[tokio::test]
async fn mailbox_failure_aborts_without_rearming() {
    let mailbox = mailbox_with_threads(2);
    mailbox.fail_listing();
    let classifier = ScriptedClassifier::new(Vec::new());
    let store = MemoryStore::new();
    let stale = store.seed_trigger("main", 10);

    let result = TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await;

    assert!(matches!(result, Err(CycleError::Collaborator(_))));
    assert_eq!(stored_watermark(&store), None);
    let triggers = store.list_triggers().expect("triggers");
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].id, stale.id);
}

#[tokio::test]
async fn classifier_transport_error_aborts_after_advancing_watermark() {
    let mailbox = mailbox_with_threads(2);
    let classifier = ScriptedClassifier::new(vec![Err(anyhow!("connection reset"))]);
    let store = MemoryStore::new();

    let result = TriageCycle::new(&config(5), &mailbox, &classifier, &store, &store)
        .run_at(now())
        .await;

    let error = result.expect_err("transport errors abort the cycle");
    assert!(error.to_string().contains("connection reset"));
    assert_eq!(
        stored_watermark(&store),
        Some(now().timestamp_millis().to_string())
    );
    assert!(store.list_triggers().expect("triggers").is_empty());
    assert!(mutations(&mailbox).is_empty());
}

#[tokio::test]
async fn sqlite_backed_cycle_leaves_one_trigger_and_persists_watermark() {
    let path = temp_db_path();
    {
        let db = Database::open(&path).expect("open db");
        db.insert_trigger("main", 10, now() - Duration::hours(1))
            .expect("seed trigger");
        db.insert_trigger("main", 10, now() - Duration::minutes(30))
            .expect("seed duplicate");
        db.insert_trigger("digest", 60, now()).expect("seed other handler");

        let mailbox = mailbox_with_threads(1);
        let classifier = ScriptedClassifier::new(vec![reply(Some(json!([
            {"threadId": "T0", "label": "academic"}
        ])))]);
        let mut raw = raw_config(5);
        raw.trigger_interval_minutes = Some(15);

        let report = run_cycle(raw, &mailbox, &classifier, &db, &db, now())
            .await
            .expect("cycle");
        assert_eq!(report.trigger.interval_minutes, 15);
    }

    let db = Database::open(&path).expect("reopen db");
    let triggers = TriggerService::list_triggers(&db).expect("triggers");
    let main: Vec<_> = triggers.iter().filter(|t| t.handler_name == "main").collect();
    assert_eq!(main.len(), 1);
    assert_eq!(main[0].interval_minutes, 15);
    assert!(triggers.iter().any(|t| t.handler_name == "digest"));
    assert_eq!(
        KeyValueStore::get(&db, WATERMARK_KEY).expect("watermark"),
        Some(now().timestamp_millis().to_string())
    );

    drop(db);
    let _ = std::fs::remove_file(path);
}
