mod commands;
mod service;

use std::path::PathBuf;

use anyhow::Result;
use console::style;

use crate::core::config::{CONFIG_FILE, WitnessConfig};
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Service")
        .command("run", "Consume the queue, sweep on schedule, receive webhooks")
        .print();

    GuideSection::new("One-shot")
        .command("ingest <owner> <repo> <run-id>", "Ingest every attempt of a run now")
        .command("enqueue <owner> <repo> <run-id>", "Queue a run for the service")
        .command("sweep", "Queue completed runs that have no run record yet")
        .command("status", "Show queue depth and poisoned messages")
        .print();

    GuideSection::new("Options")
        .text("--config <path>   Config file (default: <data dir>/witness.toml)")
        .text("WITNESS_DATA_DIR  Data directory (default: ~/.actions-witness)")
        .print();

    println!(
        "\n {} {} <command> [args]\n",
        style("Usage:").bold(),
        style("actions-witness").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CliArgs {
    pub command: Option<String>,
    pub positional: Vec<String>,
    pub config: Option<PathBuf>,
}

/// Split `--config <path>` out of the argument list; everything else is the
/// command followed by its positional arguments.
pub(crate) fn parse_args(args: &[String], start: usize) -> CliArgs {
    let mut config = None;
    let mut rest = Vec::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => {
                rest.push(args[i].clone());
                i += 1;
            }
        }
    }
    let mut rest = rest.into_iter();
    CliArgs {
        command: rest.next(),
        positional: rest.collect(),
        config,
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let parsed = parse_args(&args, 1);

    let command = match parsed.command.as_deref() {
        None | Some("help") | Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        Some(cmd) => cmd.to_string(),
    };

    let data_dir = NativePlatform::data_dir();
    let config_path = parsed
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    let config = WitnessConfig::load(&config_path).await?;

    let log_file = (command == "run").then(|| data_dir.join("run").join("witness.log"));
    crate::logging::init(&config.log_level, log_file.as_deref())?;

    match command.as_str() {
        "run" => {
            let components = service::Components::open(config, data_dir).await?;
            service::run_service(components).await
        }
        "ingest" => {
            let run = commands::parse_run_ref(&parsed.positional)?;
            let components = service::Components::open(config, data_dir).await?;
            commands::ingest(components, run).await
        }
        "enqueue" => {
            let run = commands::parse_run_ref(&parsed.positional)?;
            commands::enqueue(&config, &data_dir, run).await
        }
        "sweep" => {
            let components = service::Components::open(config, data_dir).await?;
            commands::sweep(components).await
        }
        "status" => commands::status(&config, &data_dir).await,
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}
