//! Debounced batch scheduling.
//!
//! Every local write calls [`Scheduler::notify`], which restarts a single
//! debounce timer. When the timer expires one batch runs. At most one batch
//! is in flight: the timer may still be restarted meanwhile, and it fires
//! once the batch completes. Failed batches are retried with exponential
//! backoff.

use crate::config::SyncConfig;
use crate::error::Result;
use async_trait::async_trait;
use futures::future::OptionFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// What a batch run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Journal entries covered by the run
    pub entries: usize,
    /// Whether a remote commit was made
    pub committed: bool,
}

/// Work performed when the debounce window closes.
#[async_trait]
pub trait BatchRunner: Send + Sync + 'static {
    /// Drain pending work and commit it.
    async fn run_batch(&self) -> Result<BatchOutcome>;

    /// Whether work is still waiting after a run.
    async fn has_pending(&self) -> bool;
}

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce,
            retry_backoff: config.retry_backoff,
            retry_backoff_max: config.retry_backoff_max,
        }
    }
}

impl SchedulerConfig {
    /// Delay before retry number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

#[derive(Debug)]
enum Command {
    Notify,
    Shutdown,
}

/// Handle to the background scheduling task.
#[derive(Debug)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the scheduling task on the current runtime.
    pub fn spawn<R: BatchRunner>(runner: Arc<R>, config: SchedulerConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_loop(runner, config, receiver));
        Self {
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    /// Restart the debounce window.
    pub fn notify(&self) {
        let _ = self.commands.send(Command::Notify);
    }

    /// Stop scheduling. Waits for an in-flight batch to finish.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Scheduler task ended abnormally");
            }
        }
    }
}

async fn run_loop<R: BatchRunner>(
    runner: Arc<R>,
    config: SchedulerConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut deadline: Option<Instant> = None;
    let mut running: Option<JoinHandle<Result<BatchOutcome>>> = None;
    let mut failures: u32 = 0;

    loop {
        let wake = deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Notify) => {
                    deadline = Some(Instant::now() + config.debounce);
                    tracing::debug!(debounce_ms = config.debounce.as_millis() as u64, "Batch window restarted");
                }
                Some(Command::Shutdown) | None => break,
            },
            _ = sleep_until(wake), if deadline.is_some() && running.is_none() => {
                deadline = None;
                let runner = runner.clone();
                running = Some(tokio::spawn(async move { runner.run_batch().await }));
            }
            Some(joined) = OptionFuture::from(running.as_mut()), if running.is_some() => {
                running = None;
                match joined {
                    Ok(Ok(outcome)) => {
                        failures = 0;
                        tracing::debug!(entries = outcome.entries, committed = outcome.committed, "Batch finished");
                        if deadline.is_none() && runner.has_pending().await {
                            deadline = Some(Instant::now() + config.debounce);
                        }
                    }
                    Ok(Err(err)) => {
                        failures = failures.saturating_add(1);
                        let delay = config.backoff(failures);
                        tracing::warn!(error = %err, failures, retry_ms = delay.as_millis() as u64, "Batch failed, retrying");
                        let retry_at = Instant::now() + delay;
                        deadline = Some(deadline.map_or(retry_at, |d| d.max(retry_at)));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Batch task panicked");
                        failures = failures.saturating_add(1);
                        deadline = Some(Instant::now() + config.backoff(failures));
                    }
                }
            }
        }
    }

    // In-flight commits cannot be cancelled; let the last one finish.
    if let Some(task) = running {
        let _ = task.await;
    }
    tracing::debug!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        pending: AtomicBool,
        failures_left: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl BatchRunner for CountingRunner {
        async fn run_batch(&self) -> Result<BatchOutcome> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::RemoteUnavailable("offline".into()));
            }
            self.pending.store(false, Ordering::SeqCst);
            Ok(BatchOutcome {
                entries: 1,
                committed: true,
            })
        }

        async fn has_pending(&self) -> bool {
            self.pending.load(Ordering::SeqCst)
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_millis(4000),
        }
    }

    fn runs(runner: &CountingRunner) -> usize {
        runner.runs.load(Ordering::SeqCst)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = config();
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(3), Duration::from_millis(4000));
        assert_eq!(config.backoff(10), Duration::from_millis(4000));
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn notifies_within_window_coalesce() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = Scheduler::spawn(runner.clone(), config());

        for _ in 0..10 {
            scheduler.notify();
            advance(100).await;
        }
        assert_eq!(runs(&runner), 0);

        advance(1000).await;
        assert_eq!(runs(&runner), 1);

        advance(5000).await;
        assert_eq!(runs(&runner), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_batch_in_flight() {
        let runner = Arc::new(CountingRunner {
            work: Duration::from_millis(3000),
            ..Default::default()
        });
        let scheduler = Scheduler::spawn(runner.clone(), config());

        scheduler.notify();
        advance(600).await;
        assert_eq!(runs(&runner), 1);

        // Writes during the commit: window restarts, no second commit yet.
        runner.pending.store(true, Ordering::SeqCst);
        scheduler.notify();
        advance(1000).await;
        assert_eq!(runs(&runner), 1);

        // After the first batch completes the queued window fires.
        advance(3000).await;
        assert_eq!(runs(&runner), 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_once_pending_work_clears() {
        let runner = Arc::new(CountingRunner {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        let scheduler = Scheduler::spawn(runner.clone(), config());

        runner.pending.store(true, Ordering::SeqCst);
        scheduler.notify();
        advance(700).await;
        assert_eq!(runs(&runner), 1);

        // The run cleared pending work: nothing else happens.
        advance(5000).await;
        assert_eq!(runs(&runner), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_with_backoff() {
        let runner = Arc::new(CountingRunner {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let scheduler = Scheduler::spawn(runner.clone(), config());

        scheduler.notify();
        advance(600).await;
        assert_eq!(runs(&runner), 1);

        // First retry after 1s.
        advance(800).await;
        assert_eq!(runs(&runner), 1);
        advance(200).await;
        assert_eq!(runs(&runner), 2);

        // Second retry after 2s.
        advance(1800).await;
        assert_eq!(runs(&runner), 2);
        advance(200).await;
        assert_eq!(runs(&runner), 3);

        advance(10_000).await;
        assert_eq!(runs(&runner), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_batch() {
        let runner = Arc::new(CountingRunner {
            work: Duration::from_millis(2000),
            ..Default::default()
        });
        let scheduler = Scheduler::spawn(runner.clone(), config());

        scheduler.notify();
        advance(600).await;
        assert_eq!(runner.active.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        assert_eq!(runner.active.load(Ordering::SeqCst), 0);
        assert_eq!(runs(&runner), 1);

        // Notifies after shutdown are ignored.
        scheduler.notify();
        advance(5000).await;
        assert_eq!(runs(&runner), 1);
    }
}
