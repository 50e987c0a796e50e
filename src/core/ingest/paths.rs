use chrono::{DateTime, Datelike, NaiveDate, Utc};

/// The four record sets written for every run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Runs,
    Jobs,
    Steps,
    Logs,
}

impl ArtifactKind {
    /// Every kind, in the order `RunIngestor::ingest_attempt` puts them.
    /// `Runs` is last: its blob is the completion marker the sweep looks for.
    pub const WRITE_ORDER: [ArtifactKind; 4] = [
        ArtifactKind::Jobs,
        ArtifactKind::Steps,
        ArtifactKind::Logs,
        ArtifactKind::Runs,
    ];

    pub fn container(self) -> &'static str {
        match self {
            ArtifactKind::Runs => "githubactionsruns",
            ArtifactKind::Jobs => "githubactionsjobs",
            ArtifactKind::Steps => "githubactionssteps",
            ArtifactKind::Logs => "githubactionslogs",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Runs => "run",
            ArtifactKind::Jobs => "jobs",
            ArtifactKind::Steps => "steps",
            ArtifactKind::Logs => "logs",
        }
    }
}

/// Deterministic blob path of one artifact of one run attempt.
///
/// The date segment only exists for browsing; identity is `runId-attempt`.
/// All attempts of a run share a start date and therefore a folder.
pub fn blob_path(
    kind: ArtifactKind,
    repository: &str,
    run_started_at: DateTime<Utc>,
    run_id: i64,
    attempt: u32,
) -> String {
    format!(
        "{}{}-{}.jsonl",
        day_prefix(kind, repository, run_started_at.date_naive()),
        run_id,
        attempt
    )
}

/// Prefix under which every artifact of `kind` for runs started on `day` lives.
pub fn day_prefix(kind: ArtifactKind, repository: &str, day: NaiveDate) -> String {
    format!(
        "{}/{}/{:04}/{:02}/{:02}/",
        kind.container(),
        repository,
        day.year(),
        day.month(),
        day.day()
    )
    .to_lowercase()
}
