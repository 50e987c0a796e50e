//! Row shapes of the persisted JSON-lines artifacts.

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

use super::reconcile::LogLine;
use crate::core::github::{Workflow, WorkflowJob, WorkflowRun, WorkflowStep};

/// `yyyy-MM-ddTHH:mm:ss.fffffffZ`, the seven-digit UTC form downstream
/// consumers already parse.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        ts.format("%Y-%m-%dT%H:%M:%S"),
        ts.nanosecond() % 1_000_000_000 / 100
    )
}

fn format_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(format_timestamp)
}

/// Columns shared by every row of every artifact of one attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunColumns<'a> {
    pub repository: &'a str,
    pub workflow: &'a str,
    pub workflow_id: i64,
    pub run_id: i64,
    pub run_name: &'a str,
    pub run_attempt: u32,
    pub etl_ingest_date: String,
}

impl<'a> RunColumns<'a> {
    pub fn new(run: &'a WorkflowRun, workflow: Option<&'a Workflow>, ingested_at: DateTime<Utc>) -> Self {
        Self {
            repository: &run.repository.full_name,
            workflow: workflow
                .map(|w| w.name.as_str())
                .unwrap_or_else(|| run.workflow_name()),
            workflow_id: run.workflow_id,
            run_id: run.id,
            run_name: run.run_name(),
            run_attempt: run.run_attempt,
            etl_ingest_date: format_timestamp(ingested_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord<'a> {
    #[serde(flatten)]
    pub run: &'a RunColumns<'a>,
    pub run_number: i64,
    pub head_branch: Option<&'a str>,
    pub head_sha: &'a str,
    pub event: &'a str,
    pub status: Option<&'a str>,
    pub conclusion: Option<&'a str>,
    pub check_suite_id: Option<i64>,
    pub display_title: Option<&'a str>,
    pub path: Option<&'a str>,
    pub run_started_at: String,
    pub created_at: String,
    pub updated_at: String,
    pub node_id: Option<&'a str>,
    pub check_suite_node_id: Option<&'a str>,
    pub head_repository: Option<&'a str>,
    pub url: Option<&'a str>,
    pub html_url: Option<&'a str>,
}

impl<'a> RunRecord<'a> {
    pub fn new(columns: &'a RunColumns<'a>, run: &'a WorkflowRun) -> Self {
        Self {
            run: columns,
            run_number: run.run_number,
            head_branch: run.head_branch.as_deref(),
            head_sha: &run.head_sha,
            event: &run.event,
            status: run.status.as_deref(),
            conclusion: run.conclusion.as_deref(),
            check_suite_id: run.check_suite_id,
            display_title: run.display_title.as_deref(),
            path: run.path.as_deref(),
            run_started_at: format_timestamp(run.run_started_at),
            created_at: format_timestamp(run.created_at),
            updated_at: format_timestamp(run.updated_at),
            node_id: run.node_id.as_deref(),
            check_suite_node_id: run.check_suite_node_id.as_deref(),
            head_repository: run.head_repository.as_ref().map(|r| r.full_name.as_str()),
            url: run.url.as_deref(),
            html_url: run.html_url.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord<'a> {
    #[serde(flatten)]
    pub run: &'a RunColumns<'a>,
    pub job_id: i64,
    pub name: &'a str,
    pub status: Option<&'a str>,
    pub conclusion: Option<&'a str>,
    pub created_at: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub node_id: Option<&'a str>,
    pub head_sha: Option<&'a str>,
    pub labels: &'a [String],
    pub runner_id: Option<i64>,
    pub runner_name: Option<&'a str>,
    pub runner_group_id: Option<i64>,
    pub runner_group_name: Option<&'a str>,
    pub html_url: Option<&'a str>,
}

impl<'a> JobRecord<'a> {
    pub fn new(columns: &'a RunColumns<'a>, job: &'a WorkflowJob) -> Self {
        Self {
            run: columns,
            job_id: job.id,
            name: &job.name,
            status: job.status.as_deref(),
            conclusion: job.conclusion.as_deref(),
            created_at: format_opt(job.created_at),
            started_at: format_timestamp(job.started_at),
            completed_at: format_opt(job.completed_at),
            node_id: job.node_id.as_deref(),
            head_sha: job.head_sha.as_deref(),
            labels: &job.labels,
            runner_id: job.runner_id,
            runner_name: job.runner_name.as_deref(),
            runner_group_id: job.runner_group_id,
            runner_group_name: job.runner_group_name.as_deref(),
            html_url: job.html_url.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord<'a> {
    #[serde(flatten)]
    pub run: &'a RunColumns<'a>,
    pub job: &'a str,
    pub job_id: i64,
    pub step_number: i64,
    pub name: &'a str,
    pub status: Option<&'a str>,
    pub conclusion: Option<&'a str>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl<'a> StepRecord<'a> {
    pub fn new(columns: &'a RunColumns<'a>, job: &'a WorkflowJob, step: &'a WorkflowStep) -> Self {
        Self {
            run: columns,
            job: &job.name,
            job_id: job.id,
            step_number: step.number,
            name: &step.name,
            status: step.status.as_deref(),
            conclusion: step.conclusion.as_deref(),
            started_at: format_opt(step.started_at),
            completed_at: format_opt(step.completed_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLineRecord<'a> {
    #[serde(flatten)]
    pub run: &'a RunColumns<'a>,
    pub job_id: i64,
    pub step_number: i64,
    pub line_number: usize,
    pub length: usize,
    pub timestamp: String,
    pub message: &'a str,
}

impl<'a> LogLineRecord<'a> {
    pub fn new(columns: &'a RunColumns<'a>, job: &WorkflowJob, line: &'a LogLine) -> Self {
        Self {
            run: columns,
            job_id: job.id,
            step_number: line.step,
            line_number: line.number,
            length: line.message.chars().count(),
            timestamp: format_timestamp(line.timestamp),
            message: &line.message,
        }
    }
}

/// Append one compact JSON object plus `\n` per row.
pub fn write_jsonl<T: Serialize>(buf: &mut Vec<u8>, row: &T) -> serde_json::Result<()> {
    serde_json::to_writer(&mut *buf, row)?;
    buf.push(b'\n');
    Ok(())
}
