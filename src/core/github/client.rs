use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    JobsPage, PAGE_SIZE, PlatformClient, PlatformError, RunsPage, TimeWindow, Workflow,
    WorkflowJob, WorkflowRun,
};
use crate::core::clock::Clock;
use crate::core::config::GithubConfig;

const API_VERSION: &str = "2022-11-28";

/// Fallback pause when the platform throttles without saying for how long.
const DEFAULT_THROTTLE_SECS: i64 = 60;

// ── Credentials ──

pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reads a personal access or installation token from an environment variable.
pub struct EnvTokenSource {
    var: String,
}

impl EnvTokenSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenSource for EnvTokenSource {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

// ── REST client ──

pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: Option<String>,
    clock: Arc<dyn Clock>,
}

impl GitHubClient {
    pub fn new(
        config: &GithubConfig,
        tokens: &dyn TokenSource,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let token = tokens.token();
        if token.is_none() {
            warn!(
                "No GitHub token found in ${}; unauthenticated requests are heavily rate limited",
                config.token_env
            );
        }

        let client = Client::builder().user_agent(&config.user_agent).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            clock,
        })
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{}/{}", self.api_url, owner, repo)
    }

    async fn send(&self, url: &str, query: &[(&str, String)]) -> Result<Response, PlatformError> {
        debug!("GET {}", url);
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let res = request.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        if let Some(reset_at) = rate_limit_reset(status, res.headers(), self.clock.now()) {
            return Err(PlatformError::RateLimited { reset_at });
        }

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(PlatformError::NotFound(url.to_string()));
        }

        Err(PlatformError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body: res.text().await.unwrap_or_default(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, PlatformError> {
        let res = self.send(url, query).await?;
        Ok(res.json().await?)
    }
}

#[async_trait]
impl PlatformClient for GitHubClient {
    async fn get_run(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        attempt: Option<u32>,
    ) -> Result<WorkflowRun, PlatformError> {
        let url = match attempt {
            Some(attempt) => format!(
                "{}/actions/runs/{}/attempts/{}",
                self.repo_url(owner, repo),
                run_id,
                attempt
            ),
            None => format!("{}/actions/runs/{}", self.repo_url(owner, repo), run_id),
        };
        self.get_json(&url, &[]).await
    }

    async fn get_workflow(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: i64,
    ) -> Result<Workflow, PlatformError> {
        let url = format!(
            "{}/actions/workflows/{}",
            self.repo_url(owner, repo),
            workflow_id
        );
        self.get_json(&url, &[]).await
    }

    async fn list_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        attempt: u32,
        page: u32,
    ) -> Result<Vec<WorkflowJob>, PlatformError> {
        let url = format!(
            "{}/actions/runs/{}/attempts/{}/jobs",
            self.repo_url(owner, repo),
            run_id,
            attempt
        );
        let query = [
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        let parsed: JobsPage = self.get_json(&url, &query).await?;
        Ok(parsed.jobs)
    }

    async fn get_log_archive(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        attempt: u32,
    ) -> Result<Bytes, PlatformError> {
        // The API answers with a redirect to a short-lived download URL; reqwest follows it.
        let url = format!(
            "{}/actions/runs/{}/attempts/{}/logs",
            self.repo_url(owner, repo),
            run_id,
            attempt
        );
        let res = self.send(&url, &[]).await?;
        Ok(res.bytes().await?)
    }

    async fn list_completed_runs(
        &self,
        owner: &str,
        repo: &str,
        window: &TimeWindow,
        page: u32,
    ) -> Result<RunsPage, PlatformError> {
        let url = format!("{}/actions/runs", self.repo_url(owner, repo));
        let query = [
            ("status", "completed".to_string()),
            ("created", window.created_qualifier()),
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        self.get_json(&url, &query).await
    }
}

/// Decide whether a failed response is the platform throttling us and, if so,
/// when the window resets.
///
/// Primary limits arrive as 403/429 with `x-ratelimit-remaining: 0` and an
/// epoch-seconds `x-ratelimit-reset`; secondary limits carry `retry-after`.
pub fn rate_limit_reset(
    status: StatusCode,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };

    if let Some(secs) = header("retry-after").and_then(|v| v.parse::<i64>().ok()) {
        return Some(now + Duration::seconds(secs));
    }

    if header("x-ratelimit-remaining") == Some("0") {
        let reset = header("x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        return Some(reset.unwrap_or(now + Duration::seconds(DEFAULT_THROTTLE_SECS)));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(now + Duration::seconds(DEFAULT_THROTTLE_SECS));
    }

    // A plain 403 is a permissions problem, not throttling.
    None
}
