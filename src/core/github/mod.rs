//! Read access to workflow runs, jobs and log archives on the source-control
//! platform.
//!
//! The pipeline only ever talks to [`PlatformClient`]; [`client::GitHubClient`]
//! is the REST implementation used by the service.

pub mod client;
#[cfg(test)]
pub mod fake;
mod types;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use types::{
    JobsPage, Owner, RepositoryRef, RunsPage, TimeWindow, Workflow, WorkflowJob, WorkflowRun,
    WorkflowStep,
};

/// Page size requested from every paginated endpoint.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetch a run. `attempt = None` returns the latest attempt.
    async fn get_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        attempt: Option<u32>,
    ) -> Result<WorkflowRun, PlatformError>;

    async fn get_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: i64,
    ) -> Result<Workflow, PlatformError>;

    /// One page (1-based) of the jobs of a run attempt.
    async fn list_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        attempt: u32,
        page: u32,
    ) -> Result<Vec<WorkflowJob>, PlatformError>;

    /// Zip archive with the full log of every job plus per-step excerpts.
    async fn get_log_archive(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        attempt: u32,
    ) -> Result<Bytes, PlatformError>;

    /// One page (1-based) of completed runs created inside `window`.
    async fn list_completed_runs(
        &self,
        owner: &str,
        repo: &str,
        window: &TimeWindow,
        page: u32,
    ) -> Result<RunsPage, PlatformError>;
}

/// Walk `list_jobs` until a short page comes back.
pub async fn list_all_jobs(
    client: &dyn PlatformClient,
    owner: &str,
    repo: &str,
    run_id: i64,
    attempt: u32,
) -> Result<Vec<WorkflowJob>, PlatformError> {
    let mut jobs = Vec::new();
    for page in 1.. {
        let page_jobs = client.list_jobs(owner, repo, run_id, attempt, page).await?;
        let count = page_jobs.len();
        jobs.extend(page_jobs);
        if count < PAGE_SIZE {
            break;
        }
    }
    Ok(jobs)
}
