use anyhow::{Context, Result, bail};

use super::service::Components;
use crate::core::clock::SystemClock;
use crate::core::config::WitnessConfig;
use crate::core::ingest::IngestError;
use crate::core::queue::{CompletionMessage, DurableQueue, SqliteQueue};
use crate::core::sweep::SweepError;
use crate::core::terminal::{self, GuideSection};

/// `<owner> <repo> <run-id>` positional arguments.
pub(crate) fn parse_run_ref(args: &[String]) -> Result<CompletionMessage> {
    let [owner, repository, run_id] = args else {
        bail!("expected <owner> <repo> <run-id>");
    };
    let run_id = run_id
        .parse()
        .with_context(|| format!("run id {:?} is not a number", run_id))?;
    Ok(CompletionMessage {
        owner: owner.clone(),
        repository: repository.clone(),
        run_id,
    })
}

pub(crate) async fn ingest(components: Components, run: CompletionMessage) -> Result<()> {
    terminal::print_info(&format!("Ingesting {}", run));
    match components
        .ingestor
        .ingest(&run.owner, &run.repository, run.run_id)
        .await
    {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            terminal::print_success(&format!(
                "{} attempt(s) ingested, {} artifact(s) written",
                report.attempts.len(),
                report.written()
            ));
            Ok(())
        }
        Err(IngestError::RateLimited { reset_at }) => {
            terminal::print_warn(&format!("GitHub rate limit reached; retry after {}", reset_at));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn enqueue(
    config: &WitnessConfig,
    data_dir: &std::path::Path,
    run: CompletionMessage,
) -> Result<()> {
    let queue = SqliteQueue::open(
        config.queue_path(data_dir),
        std::sync::Arc::new(SystemClock),
        config.queue.max_dequeue_count,
    )
    .await?;
    queue.enqueue(&run).await?;
    terminal::print_success(&format!(
        "Queued {} ({} message(s) waiting)",
        run,
        queue.depth().await?
    ));
    Ok(())
}

pub(crate) async fn sweep(components: Components) -> Result<()> {
    if components.config.sweep.repositories.is_empty() {
        terminal::print_warn("No repositories configured under [sweep].");
        return Ok(());
    }
    let window = components.sweeper().window();
    terminal::print_info(&format!(
        "Sweeping runs created {}",
        window.created_qualifier()
    ));
    match components.sweeper().sweep().await {
        Ok(report) => {
            for message in &report.enqueued {
                terminal::print_status("Enqueued", &message.to_string());
            }
            for repo in &report.failed {
                terminal::print_warn(&format!("{} could not be swept", repo));
            }
            terminal::print_success(&format!(
                "Saw {} run(s) across {} repositories, enqueued {}",
                report.runs_seen,
                report.repositories,
                report.enqueued.len()
            ));
            Ok(())
        }
        Err(SweepError::RateLimited { reset_at }) => {
            terminal::print_warn(&format!("GitHub rate limit reached; retry after {}", reset_at));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn status(config: &WitnessConfig, data_dir: &std::path::Path) -> Result<()> {
    let queue = SqliteQueue::open(
        config.queue_path(data_dir),
        std::sync::Arc::new(SystemClock),
        config.queue.max_dequeue_count,
    )
    .await?;
    let poisoned = queue.poisoned().await?;

    let mut section = GuideSection::new("Status")
        .status("Data dir", &data_dir.display().to_string())
        .status("Blob store", &config.storage_root(data_dir).display().to_string())
        .status("Queue depth", &queue.depth().await?.to_string())
        .status("Poisoned", &poisoned.len().to_string());
    if !poisoned.is_empty() {
        section = section.blank();
        for message in &poisoned {
            section = section.text(&format!(
                "#{} after {} deliveries: {}",
                message.id, message.dequeue_count, message.body
            ));
        }
    }
    section.print();
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_run_reference() {
        let run = parse_run_ref(&args(&["contoso", "widgets", "42"])).unwrap();
        assert_eq!(run.to_string(), "contoso/widgets#42");
    }

    #[test]
    fn rejects_incomplete_or_non_numeric_reference() {
        assert!(parse_run_ref(&args(&["contoso", "widgets"])).is_err());
        assert!(parse_run_ref(&args(&["contoso", "widgets", "latest"])).is_err());
    }

    #[tokio::test]
    async fn enqueue_persists_to_the_configured_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = WitnessConfig::default();
        let run = parse_run_ref(&args(&["contoso", "widgets", "7"])).unwrap();

        enqueue(&config, dir.path(), run.clone()).await.unwrap();

        let queue = SqliteQueue::open(
            config.queue_path(dir.path()),
            std::sync::Arc::new(SystemClock),
            5,
        )
        .await
        .unwrap();
        let leased = queue
            .dequeue(std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.message, run);
    }
}
