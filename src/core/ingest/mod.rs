//! Materializes one workflow run, every attempt of it, into four JSON-lines
//! artifacts per attempt.
//!
//! Writes are create-if-absent and skipped when the artifact already exists,
//! so redelivering the same run converges on the same blobs. The run artifact
//! goes last and only after jobs, steps and logs are all durable; its
//! presence is what the sweep treats as "done".

pub mod paths;
pub mod reconcile;
pub mod records;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::github::{PlatformClient, PlatformError, WorkflowJob, WorkflowRun, list_all_jobs};
use crate::core::store::{ObjectStore, StoreError};
use paths::{ArtifactKind, blob_path};
use reconcile::{LogArchive, reconcile_job};
use records::{JobRecord, LogLineRecord, RunColumns, RunRecord, StepRecord, write_jsonl};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("platform error: {0}")]
    Platform(PlatformError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("unreadable log archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<PlatformError> for IngestError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::NotFound(what) => IngestError::NotFound(what),
            PlatformError::RateLimited { reset_at } => IngestError::RateLimited { reset_at },
            other => IngestError::Platform(other),
        }
    }
}

impl IngestError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, IngestError::RateLimited { .. })
    }

    /// Pick the error to report when several artifacts of one attempt failed.
    /// Rate limiting wins so the caller backs off; otherwise the first stays.
    fn most_significant(self, other: IngestError) -> IngestError {
        if other.is_rate_limited() && !self.is_rate_limited() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Written { rows: usize, bytes: usize },
    SkippedExisting,
    /// Another writer created the blob between our existence check and put.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptReport {
    pub attempt: u32,
    pub jobs: WriteOutcome,
    pub steps: WriteOutcome,
    pub logs: WriteOutcome,
    pub run: WriteOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub repository: String,
    pub run_id: i64,
    pub attempts: Vec<AttemptReport>,
    /// Earlier attempts the platform no longer knows about.
    pub missing_attempts: Vec<u32>,
}

impl AttemptReport {
    pub fn outcome(&self, kind: ArtifactKind) -> WriteOutcome {
        match kind {
            ArtifactKind::Jobs => self.jobs,
            ArtifactKind::Steps => self.steps,
            ArtifactKind::Logs => self.logs,
            ArtifactKind::Runs => self.run,
        }
    }
}

impl IngestReport {
    pub fn written(&self) -> usize {
        self.attempts
            .iter()
            .flat_map(|a| ArtifactKind::WRITE_ORDER.map(|kind| a.outcome(kind)))
            .filter(|o| matches!(o, WriteOutcome::Written { .. }))
            .count()
    }
}

/// `contoso/widgets run 42 attempt 2`, used as log context.
struct Attempt<'a> {
    repository: &'a str,
    run_id: i64,
    attempt: u32,
}

impl fmt::Display for Attempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} run {} attempt {}",
            self.repository, self.run_id, self.attempt
        )
    }
}

pub struct RunIngestor {
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
}

impl RunIngestor {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            platform,
            store,
            clock,
        }
    }

    /// Ingest every attempt of a run, oldest first.
    pub async fn ingest(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<IngestReport, IngestError> {
        let latest = self.platform.get_run(owner, repo, run_id, None).await?;
        let latest_attempt = latest.run_attempt.max(1);

        let mut report = IngestReport {
            repository: latest.repository.full_name.clone(),
            run_id,
            attempts: Vec::with_capacity(latest_attempt as usize),
            missing_attempts: Vec::new(),
        };

        for attempt in 1..latest_attempt {
            let run = match self
                .platform
                .get_run(owner, repo, run_id, Some(attempt))
                .await
            {
                Ok(run) => run,
                Err(PlatformError::NotFound(_)) => {
                    warn!(
                        "{}/{} run {} attempt {} no longer exists upstream; continuing with later attempts",
                        owner, repo, run_id, attempt
                    );
                    report.missing_attempts.push(attempt);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            report
                .attempts
                .push(self.ingest_attempt(owner, repo, &run).await?);
        }
        report
            .attempts
            .push(self.ingest_attempt(owner, repo, &latest).await?);

        info!(
            "Ingested {}/{} run {} ({} attempts, {} artifacts written)",
            owner,
            repo,
            run_id,
            report.attempts.len(),
            report.written()
        );
        Ok(report)
    }

    /// Write the four artifacts of one attempt, run last.
    pub async fn ingest_attempt(
        &self,
        owner: &str,
        repo: &str,
        run: &WorkflowRun,
    ) -> Result<AttemptReport, IngestError> {
        let ctx = Attempt {
            repository: &run.repository.full_name,
            run_id: run.id,
            attempt: run.run_attempt,
        };

        let workflow = match self.platform.get_workflow(owner, repo, run.workflow_id).await {
            Ok(workflow) => Some(workflow),
            Err(PlatformError::NotFound(_)) => {
                warn!(
                    "Workflow {} of {} is gone; using the run's name",
                    run.workflow_id, ctx
                );
                None
            }
            Err(e) => return Err(e.into()),
        };
        let jobs = list_all_jobs(self.platform.as_ref(), owner, repo, run.id, run.run_attempt).await?;
        let columns = RunColumns::new(run, workflow.as_ref(), self.clock.now());
        let path = |kind| blob_path(kind, ctx.repository, run.run_started_at, run.id, run.run_attempt);

        let jobs_result = self.write_jobs(&ctx, &path(ArtifactKind::Jobs), &columns, &jobs).await;
        let steps_result = self.write_steps(&ctx, &path(ArtifactKind::Steps), &columns, &jobs).await;
        let logs_result = self
            .write_logs(&ctx, owner, repo, &path(ArtifactKind::Logs), &columns, &jobs)
            .await;

        let mut failure: Option<IngestError> = None;
        let mut outcomes = Vec::with_capacity(3);
        for (kind, result) in [
            (ArtifactKind::Jobs, jobs_result),
            (ArtifactKind::Steps, steps_result),
            (ArtifactKind::Logs, logs_result),
        ] {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    if !e.is_rate_limited() {
                        error!("Failed to write {} artifact for {}: {}", kind.as_str(), ctx, e);
                    }
                    failure = Some(match failure {
                        Some(previous) => previous.most_significant(e),
                        None => e,
                    });
                }
            }
        }

        if let Some(e) = failure {
            info!("Not writing run artifact for {} until every other artifact exists", ctx);
            return Err(e);
        }

        let run_outcome = self
            .write_run(&ctx, &path(ArtifactKind::Runs), &columns, run)
            .await
            .inspect_err(|e| error!("Failed to write run artifact for {}: {}", ctx, e))?;

        Ok(AttemptReport {
            attempt: run.run_attempt,
            jobs: outcomes[0],
            steps: outcomes[1],
            logs: outcomes[2],
            run: run_outcome,
        })
    }

    async fn write_jobs(
        &self,
        ctx: &Attempt<'_>,
        path: &str,
        columns: &RunColumns<'_>,
        jobs: &[WorkflowJob],
    ) -> Result<WriteOutcome, IngestError> {
        if self.skip_existing(ctx, path).await? {
            return Ok(WriteOutcome::SkippedExisting);
        }
        let mut body = Vec::new();
        for job in jobs {
            write_jsonl(&mut body, &JobRecord::new(columns, job))?;
        }
        self.put(ctx, path, body, jobs.len()).await
    }

    async fn write_steps(
        &self,
        ctx: &Attempt<'_>,
        path: &str,
        columns: &RunColumns<'_>,
        jobs: &[WorkflowJob],
    ) -> Result<WriteOutcome, IngestError> {
        if self.skip_existing(ctx, path).await? {
            return Ok(WriteOutcome::SkippedExisting);
        }
        let mut body = Vec::new();
        let mut rows = 0;
        for job in jobs {
            for step in job.steps.iter().filter(|s| !s.is_skipped()) {
                write_jsonl(&mut body, &StepRecord::new(columns, job, step))?;
                rows += 1;
            }
        }
        self.put(ctx, path, body, rows).await
    }

    async fn write_logs(
        &self,
        ctx: &Attempt<'_>,
        owner: &str,
        repo: &str,
        path: &str,
        columns: &RunColumns<'_>,
        jobs: &[WorkflowJob],
    ) -> Result<WriteOutcome, IngestError> {
        if self.skip_existing(ctx, path).await? {
            return Ok(WriteOutcome::SkippedExisting);
        }

        let archive = match self
            .platform
            .get_log_archive(owner, repo, ctx.run_id, ctx.attempt)
            .await
        {
            Ok(zip) => {
                let archive = LogArchive::parse(&zip)?;
                debug!("Log archive for {} holds {} entries", ctx, archive.entry_count());
                Some(archive)
            }
            Err(PlatformError::NotFound(_)) => {
                warn!("No log archive for {}; writing an empty logs artifact", ctx);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut body = Vec::new();
        let mut rows = 0;
        if let Some(archive) = &archive {
            for job in jobs {
                for line in reconcile_job(archive, job, ctx.attempt) {
                    write_jsonl(&mut body, &LogLineRecord::new(columns, job, &line))?;
                    rows += 1;
                }
            }
        }
        self.put(ctx, path, body, rows).await
    }

    async fn write_run(
        &self,
        ctx: &Attempt<'_>,
        path: &str,
        columns: &RunColumns<'_>,
        run: &WorkflowRun,
    ) -> Result<WriteOutcome, IngestError> {
        if self.skip_existing(ctx, path).await? {
            return Ok(WriteOutcome::SkippedExisting);
        }
        let mut body = Vec::new();
        write_jsonl(&mut body, &RunRecord::new(columns, run))?;
        self.put(ctx, path, body, 1).await
    }

    async fn skip_existing(&self, ctx: &Attempt<'_>, path: &str) -> Result<bool, IngestError> {
        if self.store.exists(path).await? {
            info!("Skipping existing {} for {}", path, ctx);
            return Ok(true);
        }
        Ok(false)
    }

    async fn put(
        &self,
        ctx: &Attempt<'_>,
        path: &str,
        body: Vec<u8>,
        rows: usize,
    ) -> Result<WriteOutcome, IngestError> {
        let bytes = body.len();
        match self.store.put(path, Bytes::from(body)).await {
            Ok(()) => {
                info!("Wrote {} ({} rows, {} bytes) for {}", path, rows, bytes, ctx);
                Ok(WriteOutcome::Written { rows, bytes })
            }
            Err(StoreError::Conflict(_)) => {
                info!("{} was written concurrently for {}; keeping the existing blob", path, ctx);
                Ok(WriteOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}
