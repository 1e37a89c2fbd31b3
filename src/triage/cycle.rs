use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{ClassificationRequest, Classifier};
use crate::config::{ConfigError, RawConfig, TriageConfig};
use crate::connectors::Mailbox;
use crate::db::models::Trigger;

use super::apply::{apply_results, ApplyStats};
use super::batch;
use super::fetcher::fetch_threads;
use super::prompt;
use super::scheduler::{rearm, TriggerService};
use super::validate::{check, Rejection, Verdict};
use super::watermark::{KeyValueStore, WatermarkStore};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

/// Where a cycle is in its run. Logged at debug level as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Validating,
    Fetching,
    Processing { batch: usize, of: usize },
    ClassificationFailed { batch: usize },
    Rescheduled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub threads: usize,
    pub total_tokens: u64,
    pub rejection: Option<Rejection>,
    pub stats: ApplyStats,
}

impl BatchOutcome {
    pub fn accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    /// Watermark in effect before the cycle advanced it.
    pub since_ms: i64,
    pub processed: usize,
    pub labeled: usize,
    pub left_in_inbox: usize,
    pub failed_batches: usize,
    pub total_tokens: u64,
    pub batches: Vec<BatchOutcome>,
    pub trigger: Trigger,
}

impl CycleReport {
    /// `"<ISO-8601>: <N> mails were processed."`, N counting every fetched
    /// thread whatever happened to it.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} mails were processed.",
            self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.processed
        )
    }
}

/// One triage pass over the threads that arrived since the last watermark.
pub struct TriageCycle<'a> {
    config: &'a TriageConfig,
    mailbox: &'a dyn Mailbox,
    classifier: &'a dyn Classifier,
    store: &'a dyn KeyValueStore,
    triggers: &'a dyn TriggerService,
}

impl<'a> TriageCycle<'a> {
    pub fn new(
        config: &'a TriageConfig,
        mailbox: &'a dyn Mailbox,
        classifier: &'a dyn Classifier,
        store: &'a dyn KeyValueStore,
        triggers: &'a dyn TriggerService,
    ) -> Self {
        Self {
            config,
            mailbox,
            classifier,
            store,
            triggers,
        }
    }

    pub async fn run(&self) -> Result<CycleReport, CycleError> {
        self.run_at(Utc::now()).await
    }

    /// Runs the cycle as if started at `now`.
    ///
    /// The watermark advances to `now` right after fetching. A rejected batch
    /// writes the pre-cycle watermark back, so one bad batch makes the next
    /// cycle rescan the whole window. Collaborator errors abort the cycle
    /// before the trigger is re-armed.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        enter(CyclePhase::Fetching);
        let watermark = WatermarkStore::new(self.store);
        let since_ms = watermark.read_or_default(now)?;
        let threads = fetch_threads(self.mailbox, since_ms).await?;
        watermark.write(now.timestamp_millis())?;

        let batches: Vec<_> = batch::split(&threads, self.config.batch_size).collect();
        let mut outcomes = Vec::with_capacity(batches.len());
        for (index, batch) in batches.iter().enumerate() {
            enter(CyclePhase::Processing {
                batch: index + 1,
                of: batches.len(),
            });

            let prompt = prompt::render(&self.config.labels, batch)?;
            let output = self
                .classifier
                .classify(&ClassificationRequest::json(prompt))
                .await?;
            let total_tokens = output.token_usage.total_tokens;

            let outcome = match check(output.parsed_result) {
                Verdict::Accepted(entries) => {
                    let stats = apply_results(self.mailbox, &entries, output.token_usage).await?;
                    BatchOutcome {
                        index,
                        threads: batch.len(),
                        total_tokens,
                        rejection: None,
                        stats,
                    }
                }
                Verdict::Rejected(reason) => {
                    enter(CyclePhase::ClassificationFailed { batch: index + 1 });
                    warn!(
                        batch = index + 1,
                        %reason,
                        "classifier returned an invalid value; these threads will be processed again"
                    );
                    watermark.write(since_ms)?;
                    BatchOutcome {
                        index,
                        threads: batch.len(),
                        total_tokens,
                        rejection: Some(reason),
                        stats: ApplyStats::default(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let trigger = rearm(
            self.triggers,
            &self.config.handler_name,
            self.config.trigger_interval_minutes,
        )?;
        enter(CyclePhase::Rescheduled);

        let report = build_report(now, since_ms, threads.len(), outcomes, trigger);
        info!(
            processed = report.processed,
            labeled = report.labeled,
            failed_batches = report.failed_batches,
            "triage cycle finished"
        );
        Ok(report)
    }
}

/// Validates `raw` and runs one cycle. An invalid configuration fails before
/// any collaborator is touched.
pub async fn run_cycle(
    raw: RawConfig,
    mailbox: &dyn Mailbox,
    classifier: &dyn Classifier,
    store: &dyn KeyValueStore,
    triggers: &dyn TriggerService,
    now: DateTime<Utc>,
) -> Result<CycleReport, CycleError> {
    enter(CyclePhase::Validating);
    let config = TriageConfig::from_raw(raw)?;
    TriageCycle::new(&config, mailbox, classifier, store, triggers)
        .run_at(now)
        .await
}

fn enter(phase: CyclePhase) {
    debug!(?phase, "cycle phase");
}

fn build_report(
    started_at: DateTime<Utc>,
    since_ms: i64,
    processed: usize,
    batches: Vec<BatchOutcome>,
    trigger: Trigger,
) -> CycleReport {
    let sum = |f: fn(&BatchOutcome) -> usize| batches.iter().map(f).sum::<usize>();
    CycleReport {
        started_at,
        since_ms,
        processed,
        labeled: sum(|b| b.stats.labeled),
        left_in_inbox: sum(|b| b.stats.left_in_inbox),
        failed_batches: sum(|b| usize::from(!b.accepted())),
        total_tokens: batches.iter().map(|b| b.total_tokens).sum(),
        batches,
        trigger,
    }
}
