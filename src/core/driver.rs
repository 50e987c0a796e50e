//! Generic background loop shared by the queue consumer and the sweep.
//!
//! A driver repeatedly calls one async step function. The step reports what
//! it did as a [`Tick`]; the driver decides when to call it again. All drivers
//! of a process share one [`PauseGate`] so an upstream rate limit seen by any
//! worker stops every worker until the limit resets.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Something was processed; call again immediately.
    Worked,
    /// Nothing to do; wait for the poll interval.
    Idle,
    /// Upstream asked us to back off for this long.
    Pause(Duration),
}

/// Process-wide "stop until" instant.
#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    until: Arc<Mutex<Option<Instant>>>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause for at least `duration` from now. Never shortens an existing pause.
    pub fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut guard = self.until.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none_or(|current| current < until) {
            *guard = Some(until);
        }
    }

    /// Time left on the current pause, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let guard = self.until.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    pub fn is_paused(&self) -> bool {
        self.remaining().is_some()
    }

    /// Wait until the gate is open. Returns false if cancelled first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        while self.is_paused() {
            let until = match *self.until.lock().unwrap_or_else(|e| e.into_inner()) {
                Some(until) => until,
                None => break,
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep_until(until) => {}
            }
        }
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(30),
        }
    }
}

pub struct Driver {
    name: String,
    settings: DriverSettings,
    gate: PauseGate,
    cancel: CancellationToken,
}

impl Driver {
    pub fn new(
        name: impl Into<String>,
        settings: DriverSettings,
        gate: PauseGate,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            gate,
            cancel,
        }
    }

    /// Stop every loop sharing this driver's token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run `concurrency` workers until the cancellation token fires.
    pub async fn run_loop<F, Fut>(&self, step: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Tick>> + Send + 'static,
    {
        let step = Arc::new(step);
        let mut workers = JoinSet::new();
        let concurrency = self.settings.concurrency.max(1);

        info!("{}: starting {} worker(s)", self.name, concurrency);
        for worker in 0..concurrency {
            let step = step.clone();
            let name = format!("{}#{}", self.name, worker);
            let settings = self.settings.clone();
            let gate = self.gate.clone();
            let cancel = self.cancel.clone();
            workers.spawn(async move {
                worker_loop(name, settings, gate, cancel, move || (*step)()).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("{}: worker task failed: {}", self.name, e);
            }
        }
        info!("{}: stopped", self.name);
    }

    /// Execute a single step unless the service is paused. Returns the tick,
    /// or `None` when skipped.
    pub async fn run_once<F, Fut>(&self, step: F) -> Option<Result<Tick>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tick>>,
    {
        if let Some(left) = self.gate.remaining() {
            info!("{}: skipped, paused for another {:?}", self.name, left);
            return None;
        }
        let result = step().await;
        match &result {
            Ok(Tick::Pause(duration)) => {
                warn!("{}: pausing all work for {:?}", self.name, duration);
                self.gate.pause_for(*duration);
            }
            Err(e) => error!("{}: {:#}", self.name, e),
            Ok(_) => {}
        }
        Some(result)
    }
}

async fn worker_loop<F, Fut>(
    name: String,
    settings: DriverSettings,
    gate: PauseGate,
    cancel: CancellationToken,
    step: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Tick>>,
{
    loop {
        if !gate.wait(&cancel).await {
            break;
        }

        // In-flight work is abandoned on shutdown; every write it made is
        // either complete or absent.
        let tick = tokio::select! {
            _ = cancel.cancelled() => break,
            tick = step() => tick,
        };

        let delay = match tick {
            Ok(Tick::Worked) => continue,
            Ok(Tick::Idle) => settings.poll_interval,
            Ok(Tick::Pause(duration)) => {
                warn!("{}: pausing all work for {:?}", name, duration);
                gate.pause_for(duration);
                continue;
            }
            Err(e) => {
                error!("{}: {:#}", name, e);
                settings.error_backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(concurrency: usize) -> DriverSettings {
        DriverSettings {
            concurrency,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_gate_extends_but_never_shortens() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());

        gate.pause_for(Duration::from_secs(60));
        gate.pause_for(Duration::from_secs(5));
        assert_eq!(gate.remaining(), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!gate.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_tick_stops_every_worker_until_it_expires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let gate = PauseGate::new();
        let driver = Arc::new(Driver::new("test", settings(3), gate.clone(), cancel.clone()));

        let counter = calls.clone();
        let handle = tokio::spawn({
            let driver = driver.clone();
            async move {
                driver
                    .run_loop(move || {
                        let counter = counter.clone();
                        async move {
                            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                                Ok(Tick::Pause(Duration::from_secs(42 * 60)))
                            } else {
                                Ok(Tick::Idle)
                            }
                        }
                    })
                    .await
            }
        });

        // Let the first tick land; the other two workers are already blocked
        // by the gate or see it on their next iteration.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(gate.is_paused());
        let during_pause = calls.load(Ordering::SeqCst);
        assert!(during_pause <= 3);

        tokio::time::sleep(Duration::from_secs(41 * 60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), during_pause);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert!(calls.load(Ordering::SeqCst) > during_pause);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn errors_back_off_before_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let driver = Driver::new("test", settings(1), PauseGate::new(), cancel.clone());

        let counter = calls.clone();
        let run = driver.run_loop(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("boom"))
            }
        });

        tokio::select! {
            _ = run => panic!("loop exited early"),
            _ = tokio::time::sleep(Duration::from_secs(25)) => {}
        }
        // t=0, t=10, t=20
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_is_skipped_while_paused() {
        let gate = PauseGate::new();
        let driver = Driver::new("sweep", settings(1), gate.clone(), CancellationToken::new());

        let first = driver
            .run_once(|| async { Ok(Tick::Pause(Duration::from_secs(300))) })
            .await;
        assert!(matches!(first, Some(Ok(Tick::Pause(_)))));

        let skipped = driver.run_once(|| async { Ok(Tick::Worked) }).await;
        assert!(skipped.is_none());

        tokio::time::advance(Duration::from_secs(301)).await;
        let resumed = driver.run_once(|| async { Ok(Tick::Worked) }).await;
        assert!(matches!(resumed, Some(Ok(Tick::Worked))));
    }

    #[tokio::test]
    async fn cancelled_loop_returns() {
        let cancel = CancellationToken::new();
        let driver = Driver::new("test", settings(2), PauseGate::new(), cancel.clone());
        cancel.cancel();
        driver.run_loop(|| async { Ok(Tick::Idle) }).await;
    }
}
