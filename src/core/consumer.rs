use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::driver::{Driver, Tick};
use crate::core::ingest::{IngestError, RunIngestor};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::queue::DurableQueue;

/// Drains completion messages into the ingestor, one message per tick.
pub struct QueueConsumer {
    queue: Arc<dyn DurableQueue>,
    ingestor: Arc<RunIngestor>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        ingestor: Arc<RunIngestor>,
        clock: Arc<dyn Clock>,
        lease: Duration,
    ) -> Self {
        Self {
            queue,
            ingestor,
            clock,
            lease,
        }
    }

    pub async fn tick(&self) -> Result<Tick> {
        let Some(leased) = self.queue.dequeue(self.lease).await? else {
            return Ok(Tick::Idle);
        };
        let msg = &leased.message;

        match self
            .ingestor
            .ingest(&msg.owner, &msg.repository, msg.run_id)
            .await
        {
            Ok(report) => {
                self.queue.delete(&leased.handle).await?;
                info!(
                    "Processed {} (delivery {}, {} artifacts written)",
                    msg,
                    leased.dequeue_count,
                    report.written()
                );
                Ok(Tick::Worked)
            }
            Err(IngestError::RateLimited { reset_at }) => {
                // Throttling does not count as a delivery.
                self.queue.release(&leased.handle, reset_at).await?;
                let wait = (reset_at - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                warn!(
                    "Rate limited while processing {}; released it and pausing until {}",
                    msg, reset_at
                );
                Ok(Tick::Pause(wait))
            }
            Err(IngestError::NotFound(what)) => {
                warn!("Dropping {}: {} not found upstream", msg, what);
                self.queue.delete(&leased.handle).await?;
                Ok(Tick::Worked)
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!(
                "processing {} (delivery {}) failed; it will be redelivered",
                msg, leased.dequeue_count
            ))),
        }
    }
}

/// Runs the consumer on a driver for the lifetime of the service.
pub struct ConsumerService {
    consumer: Arc<QueueConsumer>,
    driver: Arc<Driver>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerService {
    pub fn new(consumer: Arc<QueueConsumer>, driver: Arc<Driver>) -> Self {
        Self {
            consumer,
            driver,
            handle: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ConsumerService {
    async fn on_start(&mut self) -> Result<()> {
        let consumer = self.consumer.clone();
        let driver = self.driver.clone();
        self.handle = Some(tokio::spawn(async move {
            driver
                .run_loop(move || {
                    let consumer = consumer.clone();
                    async move { consumer.tick().await }
                })
                .await;
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.driver.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}
