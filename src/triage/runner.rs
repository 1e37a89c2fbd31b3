//! Hosts the cycle: runs it under a single-flight lease and, in watch mode,
//! fires it whenever the handler's trigger comes due.

use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::TriageConfig;
use crate::connectors::Mailbox;
use crate::db::Database;

use super::cycle::{CycleError, CycleReport, TriageCycle};
use super::scheduler::next_trigger;

pub const DEFAULT_LEASE_TTL_MINUTES: i64 = 15;
pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// No trigger is bound to the handler any more.
    ChainStopped { cycles: usize },
    /// A cycle failed, so it never re-armed itself.
    Aborted { cycles: usize },
    CycleLimitReached { cycles: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Upper bound on a single sleep, so removed triggers are noticed.
    pub poll_interval: StdDuration,
    pub max_cycles: Option<usize>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_cycles: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Stop,
    FireNow,
    Sleep(StdDuration),
}

/// What the watch loop does next given the handler's next firing time.
pub fn next_wake(fire_at: Option<DateTime<Utc>>, now: DateTime<Utc>, poll: StdDuration) -> Wake {
    let Some(fire_at) = fire_at else {
        return Wake::Stop;
    };
    match (fire_at - now).to_std() {
        Ok(wait) if !wait.is_zero() => Wake::Sleep(wait.min(poll)),
        _ => Wake::FireNow,
    }
}

pub struct CycleRunner<'a> {
    config: &'a TriageConfig,
    mailbox: &'a dyn Mailbox,
    classifier: &'a dyn Classifier,
    db: &'a Database,
    holder: String,
    lease_ttl: Duration,
}

impl<'a> CycleRunner<'a> {
    pub fn new(
        config: &'a TriageConfig,
        mailbox: &'a dyn Mailbox,
        classifier: &'a dyn Classifier,
        db: &'a Database,
    ) -> Self {
        Self {
            config,
            mailbox,
            classifier,
            db,
            holder: Uuid::new_v4().to_string(),
            lease_ttl: Duration::minutes(DEFAULT_LEASE_TTL_MINUTES),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn lease_name(&self) -> String {
        format!("cycle:{}", self.config.handler_name)
    }

    /// Runs one cycle while holding the handler's lease. Returns `None`
    /// without touching anything when another runner holds it.
    pub async fn run_once(&self) -> Result<Option<CycleReport>, CycleError> {
        let lease = self.lease_name();
        let acquired = self
            .db
            .try_acquire_lease(&lease, &self.holder, self.lease_ttl, Utc::now())
            .context("acquire cycle lease")?;
        if !acquired {
            warn!(lease = %lease, "another cycle holds the lease; skipping");
            return Ok(None);
        }

        let result = TriageCycle::new(
            self.config,
            self.mailbox,
            self.classifier,
            self.db,
            self.db,
        )
        .run()
        .await;

        if let Err(error) = self.db.release_lease(&lease, &self.holder) {
            warn!(lease = %lease, %error, "failed to release cycle lease");
        }
        result.map(Some)
    }

    /// Runs a cycle now, then one each time the handler's trigger fires,
    /// until the chain stops.
    pub async fn watch(&self, options: WatchOptions) -> WatchOutcome {
        let mut cycles = 0usize;
        let mut fire_now = true;

        loop {
            if fire_now {
                match self.run_once().await {
                    Ok(Some(report)) => {
                        cycles += 1;
                        info!("{}", report.summary());
                    }
                    Ok(None) => {
                        tokio::time::sleep(options.poll_interval).await;
                    }
                    Err(error) => {
                        error!(%error, "triage cycle aborted; chain stopped");
                        return WatchOutcome::Aborted { cycles };
                    }
                }
                if options.max_cycles.is_some_and(|max| cycles >= max) {
                    return WatchOutcome::CycleLimitReached { cycles };
                }
            }

            let fire_at = match next_trigger(self.db, &self.config.handler_name) {
                Ok(trigger) => trigger.map(|t| t.next_fire_at()),
                Err(error) => {
                    error!(%error, "trigger lookup failed; chain stopped");
                    return WatchOutcome::Aborted { cycles };
                }
            };
            match next_wake(fire_at, Utc::now(), options.poll_interval) {
                Wake::Stop => {
                    info!(
                        handler = %self.config.handler_name,
                        "no trigger bound to handler; chain stopped"
                    );
                    return WatchOutcome::ChainStopped { cycles };
                }
                Wake::FireNow => fire_now = true,
                Wake::Sleep(wait) => {
                    fire_now = false;
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
