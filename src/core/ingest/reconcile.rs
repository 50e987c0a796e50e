//! Step attribution for job logs.
//!
//! A run's log archive holds, per job, one full log with no step information
//! and one excerpt per executed step. The full log is the source of truth for
//! line order; the excerpts tell which lines belong to which step. We find
//! the excerpts inside the full log and copy their step number, step-local
//! line number and timestamp onto the matching lines.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::core::github::{WorkflowJob, WorkflowStep};

/// `job/3_Run tests.txt` is step 3 of `job`; `0_job.txt` is the full log of `job`.
static LOG_ENTRY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<folder>.*)/)?(?P<index>\d+)_(?P<name>[^/]+)\.txt$")
        .unwrap_or_else(|e| panic!("invalid log entry pattern: {e}"))
});

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// 0 until attributed to a step.
    pub step: i64,
    /// 1-based, relative to the log the line was numbered in.
    pub number: usize,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Split an optional leading RFC 3339 timestamp off a raw log line.
/// Lines without one inherit `last`.
pub fn parse_log_line(line: &str, last: DateTime<Utc>) -> (DateTime<Utc>, &str) {
    if let Some((head, rest)) = line.split_once(' ')
        && head.len() >= 20
        && head.ends_with('Z')
        && let Ok(ts) = DateTime::parse_from_rfc3339(head)
    {
        return (ts.with_timezone(&Utc), rest);
    }
    (last, line)
}

/// Number and timestamp every line of one log, carrying timestamps forward
/// from `start`.
pub fn read_log_lines(text: &str, step: i64, start: DateTime<Utc>) -> Vec<LogLine> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut last = start;
    text.lines()
        .enumerate()
        .map(|(idx, raw)| {
            let (timestamp, message) = parse_log_line(raw, last);
            last = timestamp;
            LogLine {
                step,
                number: idx + 1,
                timestamp,
                message: message.to_string(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Nothing to align.
    Empty,
    Matched { offset: usize },
    NoMatch,
}

/// Relabel the first window of `job_lines` whose messages equal those of
/// `step_lines`, element for element.
/// Plain O(n·k) scan.
pub fn align_step_lines(job_lines: &mut [LogLine], step_lines: &[LogLine]) -> Alignment {
    if step_lines.is_empty() {
        return Alignment::Empty;
    }
    if step_lines.len() > job_lines.len() {
        return Alignment::NoMatch;
    }

    let offset = (0..=job_lines.len() - step_lines.len()).find(|&start| {
        job_lines[start..start + step_lines.len()]
            .iter()
            .zip(step_lines)
            .all(|(job_line, step_line)| job_line.message == step_line.message)
    });

    let Some(offset) = offset else {
        return Alignment::NoMatch;
    };

    for (job_line, step_line) in job_lines[offset..].iter_mut().zip(step_lines) {
        job_line.step = step_line.step;
        job_line.number = step_line.number;
        job_line.timestamp = step_line.timestamp;
    }
    Alignment::Matched { offset }
}

/// Text entries of a run attempt's log archive, indexed by job and step.
#[derive(Debug, Default)]
pub struct LogArchive {
    entries: HashMap<String, String>,
}

impl LogArchive {
    pub fn parse(bytes: &[u8]) -> Result<Self, zip::result::ZipError> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut archive = LogArchive::default();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let Some(key) = entry_key(&name) else {
                debug!("Ignoring log archive entry {}", name);
                continue;
            };
            let mut raw = Vec::new();
            file.read_to_end(&mut raw)?;
            archive
                .entries
                .insert(key, String::from_utf8_lossy(&raw).into_owned());
        }
        Ok(archive)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn job_log(&self, job_name: &str) -> Option<&str> {
        self.entries.get(job_name).map(String::as_str)
    }

    pub fn step_log(&self, job_name: &str, step_number: i64) -> Option<&str> {
        self.entries
            .get(&format!("{}/{}", job_name, step_number))
            .map(String::as_str)
    }
}

/// Full job logs are keyed by job name, step logs by `job/stepNumber`.
fn entry_key(entry_name: &str) -> Option<String> {
    let caps = LOG_ENTRY_NAME.captures(entry_name)?;
    match caps.name("folder").map(|m| m.as_str()) {
        Some(folder) if !folder.is_empty() => Some(format!("{}/{}", folder, &caps["index"])),
        _ => Some(caps["name"].to_string()),
    }
}

/// Reconciled lines of one job, in full-log order. Returns no lines when the
/// archive has no full log for the job.
pub fn reconcile_job(archive: &LogArchive, job: &WorkflowJob, attempt: u32) -> Vec<LogLine> {
    let Some(job_text) = archive.job_log(&job.name) else {
        // Jobs a retry did not re-run have no runner and no logs.
        if !job.is_retry_skipped(attempt) {
            warn!(
                "Missing log entry for job {} ({}), attempt {}",
                job.name, job.id, attempt
            );
        }
        return Vec::new();
    };

    let mut job_lines = read_log_lines(job_text, 0, job.started_at);

    let mut steps: Vec<&WorkflowStep> = job.steps.iter().filter(|s| !s.is_skipped()).collect();
    steps.sort_by_key(|s| s.number);

    let mut step_lines = Vec::new();
    for step in steps {
        match archive.step_log(&job.name, step.number) {
            Some(text) => step_lines.extend(read_log_lines(
                text,
                step.number,
                step.started_at.unwrap_or(job.started_at),
            )),
            None => warn!(
                "Missing log entry for step {} ({}) of job {} ({})",
                step.number, step.name, job.name, job.id
            ),
        }
    }

    if align_step_lines(&mut job_lines, &step_lines) == Alignment::NoMatch {
        warn!(
            "Step logs of job {} ({}) did not align with the job log; {} lines left unattributed",
            job.name,
            job.id,
            job_lines.len()
        );
    }

    job_lines
}
