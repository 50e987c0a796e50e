use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{
    PAGE_SIZE, PlatformClient, PlatformError, RunsPage, TimeWindow, Workflow, WorkflowJob,
    WorkflowRun,
};

/// Scriptable in-process platform for pipeline tests.
#[derive(Default)]
pub struct FakePlatform {
    runs: Mutex<HashMap<(i64, u32), WorkflowRun>>,
    jobs: Mutex<HashMap<(i64, u32), Vec<WorkflowJob>>>,
    archives: Mutex<HashMap<(i64, u32), Bytes>>,
    workflows: Mutex<HashMap<i64, Workflow>>,
    completed: Mutex<HashMap<String, Vec<WorkflowRun>>>,
    rate_limited: Mutex<HashMap<&'static str, DateTime<Utc>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one attempt of a run. The highest attempt added is "latest".
    pub fn add_run(&self, run: WorkflowRun) {
        self.runs
            .lock()
            .unwrap()
            .insert((run.id, run.run_attempt), run);
    }

    pub fn set_jobs(&self, run_id: i64, attempt: u32, jobs: Vec<WorkflowJob>) {
        self.jobs.lock().unwrap().insert((run_id, attempt), jobs);
    }

    pub fn set_archive(&self, run_id: i64, attempt: u32, zip: Vec<u8>) {
        self.archives
            .lock()
            .unwrap()
            .insert((run_id, attempt), Bytes::from(zip));
    }

    pub fn add_workflow(&self, workflow: Workflow) {
        self.workflows.lock().unwrap().insert(workflow.id, workflow);
    }

    /// Completed runs reported for `owner/repo` by `list_completed_runs`.
    pub fn set_completed_runs(&self, full_name: &str, runs: Vec<WorkflowRun>) {
        self.completed
            .lock()
            .unwrap()
            .insert(full_name.to_lowercase(), runs);
    }

    /// Make `endpoint` (a trait method name) answer `RateLimited`.
    pub fn rate_limit(&self, endpoint: &'static str, reset_at: DateTime<Utc>) {
        self.rate_limited.lock().unwrap().insert(endpoint, reset_at);
    }

    pub fn clear_rate_limits(&self) {
        self.rate_limited.lock().unwrap().clear();
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, endpoint: &'static str) -> Result<(), PlatformError> {
        *self.calls.lock().unwrap().entry(endpoint).or_default() += 1;
        match self.rate_limited.lock().unwrap().get(endpoint) {
            Some(reset_at) => Err(PlatformError::RateLimited {
                reset_at: *reset_at,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn get_run(
        &self,
        _owner: &str,
        _repo: &str,
        run_id: i64,
        attempt: Option<u32>,
    ) -> Result<WorkflowRun, PlatformError> {
        self.enter("get_run")?;
        let runs = self.runs.lock().unwrap();
        let found = match attempt {
            Some(attempt) => runs.get(&(run_id, attempt)),
            None => runs
                .iter()
                .filter(|((id, _), _)| *id == run_id)
                .max_by_key(|((_, attempt), _)| *attempt)
                .map(|(_, run)| run),
        };
        found
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("run {} attempt {:?}", run_id, attempt)))
    }

    async fn get_workflow(
        &self,
        _owner: &str,
        _repo: &str,
        workflow_id: i64,
    ) -> Result<Workflow, PlatformError> {
        self.enter("get_workflow")?;
        self.workflows
            .lock()
            .unwrap()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("workflow {}", workflow_id)))
    }

    async fn list_jobs(
        &self,
        _owner: &str,
        _repo: &str,
        run_id: i64,
        attempt: u32,
        page: u32,
    ) -> Result<Vec<WorkflowJob>, PlatformError> {
        self.enter("list_jobs")?;
        let jobs = self.jobs.lock().unwrap();
        let all = jobs.get(&(run_id, attempt)).cloned().unwrap_or_default();
        Ok(all
            .into_iter()
            .skip((page as usize - 1) * PAGE_SIZE)
            .take(PAGE_SIZE)
            .collect())
    }

    async fn get_log_archive(
        &self,
        _owner: &str,
        _repo: &str,
        run_id: i64,
        attempt: u32,
    ) -> Result<Bytes, PlatformError> {
        self.enter("get_log_archive")?;
        self.archives
            .lock()
            .unwrap()
            .get(&(run_id, attempt))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("logs of run {} attempt {}", run_id, attempt)))
    }

    async fn list_completed_runs(
        &self,
        owner: &str,
        repo: &str,
        window: &TimeWindow,
        page: u32,
    ) -> Result<RunsPage, PlatformError> {
        self.enter("list_completed_runs")?;
        let completed = self.completed.lock().unwrap();
        let in_window: Vec<WorkflowRun> = completed
            .get(&format!("{}/{}", owner, repo).to_lowercase())
            .map(|runs| {
                runs.iter()
                    .filter(|r| r.created_at >= window.start && r.created_at <= window.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(RunsPage {
            total_count: in_window.len() as u64,
            workflow_runs: in_window
                .into_iter()
                .skip((page as usize - 1) * PAGE_SIZE)
                .take(PAGE_SIZE)
                .collect(),
        })
    }
}

// ── Fixtures ──

pub fn run(full_name: &str, id: i64, attempt: u32, started_at: &str) -> WorkflowRun {
    let (owner, name) = full_name.split_once('/').unwrap();
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": "CI",
        "display_title": format!("Run {}", id),
        "workflow_id": 7,
        "run_number": id,
        "run_attempt": attempt,
        "event": "push",
        "status": "completed",
        "conclusion": "success",
        "head_branch": "main",
        "head_sha": "abc123",
        "run_started_at": started_at,
        "created_at": started_at,
        "updated_at": started_at,
        "repository": {"name": name, "full_name": full_name, "owner": {"login": owner}}
    }))
    .unwrap()
}

/// A job whose steps are `(number, name, conclusion)`.
pub fn job(id: i64, run_id: i64, name: &str, runner: &str, steps: &[(i64, &str, &str)]) -> WorkflowJob {
    let steps: Vec<serde_json::Value> = steps
        .iter()
        .map(|(number, name, conclusion)| {
            serde_json::json!({
                "number": number,
                "name": name,
                "status": "completed",
                "conclusion": conclusion,
                "started_at": "2024-03-01T10:00:00Z",
                "completed_at": "2024-03-01T10:01:00Z"
            })
        })
        .collect();
    serde_json::from_value(serde_json::json!({
        "id": id,
        "run_id": run_id,
        "name": name,
        "status": "completed",
        "conclusion": "success",
        "started_at": "2024-03-01T10:00:00Z",
        "completed_at": "2024-03-01T10:02:00Z",
        "runner_name": runner,
        "labels": ["ubuntu-latest"],
        "steps": steps
    }))
    .unwrap()
}

/// Zip archive laid out like the platform's run log download.
pub fn log_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
