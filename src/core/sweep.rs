//! Periodic repair for lost completion events.
//!
//! Lists the runs that completed upstream in a trailing window and enqueues
//! every one whose run artifact is missing. Ingestion is idempotent, so a
//! spurious enqueue only costs a few existence checks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::core::clock::Clock;
use crate::core::driver::{Driver, Tick};
use crate::core::github::{PAGE_SIZE, PlatformClient, PlatformError, TimeWindow};
use crate::core::ingest::paths::{ArtifactKind, blob_path, day_prefix};
use crate::core::lifecycle::LifecycleManager;
use crate::core::queue::{CompletionMessage, DurableQueue, QueueError};
use crate::core::store::{ObjectStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("platform error: {0}")]
    Platform(PlatformError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<PlatformError> for SweepError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::RateLimited { reset_at } => SweepError::RateLimited { reset_at },
            other => SweepError::Platform(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub lookback: chrono::Duration,
    /// Runs younger than this are left to the regular event path.
    pub settle: chrono::Duration,
    /// `owner/name` pairs.
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub repositories: usize,
    pub runs_seen: usize,
    pub enqueued: Vec<CompletionMessage>,
    pub failed: Vec<String>,
}

pub struct Sweeper {
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn DurableQueue>,
    clock: Arc<dyn Clock>,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn DurableQueue>,
        clock: Arc<dyn Clock>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            platform,
            store,
            queue,
            clock,
            settings,
        }
    }

    pub fn window(&self) -> TimeWindow {
        let now = self.clock.now();
        TimeWindow {
            start: now - self.settings.lookback,
            end: now - self.settings.settle,
        }
    }

    /// Sweep every configured repository. A rate limit aborts the whole
    /// sweep; any other per-repository failure is logged and skipped.
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let window = self.window();
        let mut report = SweepReport::default();

        for full_name in &self.settings.repositories {
            let Some((owner, name)) = full_name.split_once('/') else {
                warn!("Skipping malformed repository {:?}", full_name);
                report.failed.push(full_name.clone());
                continue;
            };
            report.repositories += 1;

            match self.sweep_repository(owner, name, &window, &mut report).await {
                Ok(()) => {}
                Err(SweepError::RateLimited { reset_at }) => {
                    warn!(
                        "Sweep rate limited at {}; skipping the remaining repositories until {}",
                        full_name, reset_at
                    );
                    return Err(SweepError::RateLimited { reset_at });
                }
                Err(e) => {
                    error!("Sweep of {} failed: {}", full_name, e);
                    report.failed.push(full_name.clone());
                }
            }
        }

        info!(
            "Sweep of {} repositories saw {} runs and enqueued {}",
            report.repositories,
            report.runs_seen,
            report.enqueued.len()
        );
        Ok(report)
    }

    async fn sweep_repository(
        &self,
        owner: &str,
        name: &str,
        window: &TimeWindow,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        let full_name = format!("{}/{}", owner, name);

        // Runs are filed by start date, which can trail the creation window,
        // so collect every day up to today.
        let today = self.clock.now().date_naive();
        let mut existing = HashSet::new();
        let mut day = window.start.date_naive();
        while day <= today {
            let prefix = day_prefix(ArtifactKind::Runs, &full_name, day);
            existing.extend(self.store.list_by_prefix(&prefix).await?);
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }

        let mut page = 1;
        loop {
            let runs = self
                .platform
                .list_completed_runs(owner, name, window, page)
                .await?;
            let count = runs.workflow_runs.len();

            for run in runs.workflow_runs {
                report.runs_seen += 1;
                let path = blob_path(
                    ArtifactKind::Runs,
                    &full_name,
                    run.run_started_at,
                    run.id,
                    run.run_attempt,
                );
                if existing.contains(&path) {
                    continue;
                }
                let message = CompletionMessage {
                    owner: owner.to_string(),
                    repository: name.to_string(),
                    run_id: run.id,
                };
                self.queue.enqueue(&message).await?;
                info!("Sweep enqueued {} (attempt {} has no run artifact)", message, run.run_attempt);
                report.enqueued.push(message);
            }

            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(())
    }

    /// Driver step: one full sweep.
    pub async fn tick(&self) -> Result<Tick> {
        match self.sweep().await {
            Ok(_) => Ok(Tick::Worked),
            Err(SweepError::RateLimited { reset_at }) => Ok(Tick::Pause(
                (reset_at - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Register the sweep on the lifecycle's cron scheduler. Ticks that fire
/// while the service is paused are skipped.
pub async fn schedule(
    lifecycle: &LifecycleManager,
    cron: &str,
    driver: Arc<Driver>,
    sweeper: Arc<Sweeper>,
) -> Result<()> {
    let job = tokio_cron_scheduler::Job::new_async(cron, move |_uuid, mut _l| {
        let driver = driver.clone();
        let sweeper = sweeper.clone();
        Box::pin(async move {
            driver.run_once(|| sweeper.tick()).await;
        })
    })?;
    lifecycle.scheduler.add(job).await?;
    info!("Scheduled reconciliation sweep ({})", cron);
    Ok(())
}
