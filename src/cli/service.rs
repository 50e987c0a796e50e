use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::WitnessConfig;
use crate::core::consumer::{ConsumerService, QueueConsumer};
use crate::core::driver::{Driver, DriverSettings, PauseGate};
use crate::core::github::PlatformClient;
use crate::core::github::client::{EnvTokenSource, GitHubClient};
use crate::core::ingest::RunIngestor;
use crate::core::lifecycle::LifecycleManager;
use crate::core::queue::SqliteQueue;
use crate::core::store::FsObjectStore;
use crate::core::sweep::{self, Sweeper};
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::webhook::{WebhookServer, WebhookState};

/// Everything the pipeline needs, opened from config.
pub(crate) struct Components {
    pub config: WitnessConfig,
    pub clock: Arc<dyn Clock>,
    pub platform: Arc<dyn PlatformClient>,
    pub store: Arc<FsObjectStore>,
    pub queue: Arc<SqliteQueue>,
    pub ingestor: Arc<RunIngestor>,
}

impl Components {
    pub async fn open(config: WitnessConfig, data_dir: PathBuf) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tokens = EnvTokenSource::new(config.github.token_env.clone());
        let platform: Arc<dyn PlatformClient> =
            Arc::new(GitHubClient::new(&config.github, &tokens, clock.clone())?);
        let store = Arc::new(FsObjectStore::new(config.storage_root(&data_dir)).await?);
        let queue = Arc::new(
            SqliteQueue::open(
                config.queue_path(&data_dir),
                clock.clone(),
                config.queue.max_dequeue_count,
            )
            .await?,
        );
        let ingestor = Arc::new(RunIngestor::new(
            platform.clone(),
            store.clone(),
            clock.clone(),
        ));
        Ok(Self {
            config,
            clock,
            platform,
            store,
            queue,
            ingestor,
        })
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.platform.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
            self.config.sweep_settings(),
        )
    }
}

/// Consumer workers, scheduled sweep and optional webhook receiver until Ctrl+C.
pub(crate) async fn run_service(components: Components) -> Result<()> {
    let config = components.config.clone();
    let gate = PauseGate::new();
    let cancel = CancellationToken::new();
    let mut lifecycle = LifecycleManager::new().await?;

    let consumer = Arc::new(QueueConsumer::new(
        components.queue.clone(),
        components.ingestor.clone(),
        components.clock.clone(),
        config.lease(),
    ));
    let consumer_driver = Arc::new(Driver::new(
        "consumer",
        config.driver_settings(),
        gate.clone(),
        cancel.clone(),
    ));
    lifecycle.attach(Arc::new(Mutex::new(ConsumerService::new(
        consumer,
        consumer_driver,
    ))));

    let webhook_secret = std::env::var(&config.webhook.secret_env)
        .ok()
        .filter(|s| !s.trim().is_empty());
    if config.webhook.enabled {
        if webhook_secret.is_none() {
            terminal::print_warn(&format!(
                "${} is not set; webhook signatures will not be verified.",
                config.webhook.secret_env
            ));
        }
        let state = WebhookState {
            queue: components.queue.clone(),
            secret: webhook_secret,
            gate: gate.clone(),
        };
        lifecycle.attach(Arc::new(Mutex::new(WebhookServer::new(
            &config.webhook.host,
            config.webhook.port,
            state,
            cancel.clone(),
        ))));
    }

    let sweeping = config.sweep.enabled && !config.sweep.repositories.is_empty();
    if sweeping {
        let sweep_driver = Arc::new(Driver::new(
            "sweep",
            DriverSettings::default(),
            gate.clone(),
            cancel.clone(),
        ));
        sweep::schedule(
            &lifecycle,
            &config.sweep.cron,
            sweep_driver,
            Arc::new(components.sweeper()),
        )
        .await?;
    } else {
        info!("Reconciliation sweep disabled or no repositories configured");
    }

    lifecycle.start().await?;
    info!("Service lifecycle: {:?}", lifecycle.state());

    let mut section = GuideSection::new("actions-witness")
        .status("Blob store", &components.store.root().display().to_string())
        .status("Queue depth", &components.queue.depth().await?.to_string())
        .status("Consumers", &config.consumer.concurrency.to_string());
    section = if sweeping {
        section.status(
            "Sweep",
            &format!(
                "{} ({} repositories)",
                config.sweep.cron,
                config.sweep.repositories.len()
            ),
        )
    } else {
        section.status("Sweep", "off")
    };
    if config.webhook.enabled {
        section = section.status(
            "Webhook",
            &format!(
                "http://{}:{}/api/github/webhook",
                config.webhook.host, config.webhook.port
            ),
        );
    }
    section
        .blank()
        .status(
            "Press Ctrl+C to stop.",
            &format!("{}", style("Ctrl+C").bold().yellow()),
        )
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
