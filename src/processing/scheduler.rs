//! # Scheduler
//!
//! Decides when to drain and keeps drains from overlapping.
//!
//! ```text
//!            wake (timer tick | trigger)
//!   ┌──────┐ ─────────────────────────▶ ┌─────────┐
//!   │ idle │                            │ running │ drain: process_batch until NothingLeft
//!   └──────┘ ◀───────────────────────── └─────────┘
//!            nothing left | error
//! ```
//!
//! [`Scheduler::run`] drains once on entry, then waits on cancellation, the
//! interval timer and the coalescing trigger. Wakes that arrive during a
//! drain collapse into one pending wake, so they cause at most one follow-up
//! drain. A fatal batch error ends the loop; restarting is left to whatever
//! supervises the process.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::batch_claimer::{BatchOutcome, BatchProcessor};
use super::trigger::{wake_channel, WakeOutcome, WakeReceiver, WakeSender};
use crate::config::ProcessingConfig;
use crate::constants::defaults;
use crate::error::{WorkerError, WorkerResult};

/// Scheduler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Period of the fallback timer
    pub interval: Duration,
    /// Items per `process_batch` call
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: defaults::PROCESS_INTERVAL,
            batch_size: defaults::BATCH_SIZE,
        }
    }
}

impl From<&ProcessingConfig> for SchedulerConfig {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            interval: config.interval,
            batch_size: config.batch_size,
        }
    }
}

/// Whether a drain is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
}

/// Why the run loop returned without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Cancelled,
}

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The processor reported nothing left
    Exhausted,
    /// Cancellation stopped the drain between batches
    Cancelled,
    /// Another drain was already running
    Skipped,
}

/// Summary of one drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: u64,
    pub items: u64,
    pub duration: Duration,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            batches: 0,
            items: 0,
            duration: Duration::ZERO,
            outcome: DrainOutcome::Skipped,
        }
    }
}

#[derive(Debug)]
enum WakeSource {
    Timer,
    Trigger,
}

#[derive(Debug, Default)]
struct SchedulerStats {
    drains: AtomicU64,
    drains_skipped: AtomicU64,
    batches: AtomicU64,
    items: AtomicU64,
    timer_wakes: AtomicU64,
    trigger_wakes: AtomicU64,
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub drains: u64,
    pub drains_skipped: u64,
    pub batches: u64,
    pub items: u64,
    pub timer_wakes: u64,
    pub trigger_wakes: u64,
    pub coalesced_wakes: u64,
}

/// Resets the run state to idle however the drain ends
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serialises wakes into non-overlapping drains of one processor
pub struct Scheduler<P: BatchProcessor> {
    name: String,
    processor: Arc<P>,
    config: SchedulerConfig,
    running: AtomicBool,
    wake_tx: WakeSender,
    wake_rx: AsyncMutex<WakeReceiver>,
    stats: SchedulerStats,
}

impl<P: BatchProcessor> std::fmt::Debug for Scheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("run_state", &self.run_state())
            .finish()
    }
}

impl<P: BatchProcessor> Scheduler<P> {
    pub fn new(name: impl Into<String>, processor: Arc<P>, config: SchedulerConfig) -> Self {
        let (wake_tx, wake_rx) = wake_channel();
        Self {
            name: name.into(),
            processor,
            config,
            running: AtomicBool::new(false),
            wake_tx,
            wake_rx: AsyncMutex::new(wake_rx),
            stats: SchedulerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    /// Handle for external wake sources
    pub fn trigger(&self) -> WakeSender {
        self.wake_tx.clone()
    }

    /// Request a drain; coalesces with any wake already pending
    pub fn wake(&self) -> WakeOutcome {
        self.wake_tx.wake()
    }

    pub fn run_state(&self) -> RunState {
        if self.running.load(Ordering::Acquire) {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            drains: self.stats.drains.load(Ordering::Relaxed),
            drains_skipped: self.stats.drains_skipped.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            items: self.stats.items.load(Ordering::Relaxed),
            timer_wakes: self.stats.timer_wakes.load(Ordering::Relaxed),
            trigger_wakes: self.stats.trigger_wakes.load(Ordering::Relaxed),
            coalesced_wakes: self.wake_tx.stats().coalesced,
        }
    }

    /// Process batches until the processor reports nothing left
    ///
    /// Returns a [`DrainOutcome::Skipped`] report without touching the
    /// processor when another drain on this scheduler is in progress.
    #[instrument(skip(self, cancel), fields(scheduler = %self.name))]
    pub async fn drain(&self, cancel: &CancellationToken) -> WorkerResult<DrainReport> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            self.stats.drains_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Drain already running, wake coalesced");
            return Ok(DrainReport::skipped());
        };

        let started = std::time::Instant::now();
        if let Some(backlog) = self.processor.backlog_size().await {
            debug!(backlog, "Starting drain");
        }

        let mut batches = 0u64;
        let mut items = 0u64;
        let outcome = loop {
            if cancel.is_cancelled() {
                break DrainOutcome::Cancelled;
            }
            match self.processor.process_batch(self.config.batch_size).await? {
                BatchOutcome::Processed(count) => {
                    batches += 1;
                    items += count as u64;
                    self.stats.batches.fetch_add(1, Ordering::Relaxed);
                    self.stats.items.fetch_add(count as u64, Ordering::Relaxed);
                }
                BatchOutcome::NothingLeft => break DrainOutcome::Exhausted,
            }
        };
        self.stats.drains.fetch_add(1, Ordering::Relaxed);

        let report = DrainReport {
            batches,
            items,
            duration: started.elapsed(),
            outcome,
        };
        if items > 0 {
            info!(
                batches,
                items,
                duration_ms = report.duration.as_millis() as u64,
                outcome = ?outcome,
                "Drain finished"
            );
        } else {
            debug!(outcome = ?outcome, "Drain found no work");
        }
        Ok(report)
    }

    /// Run until cancelled or a drain fails
    pub async fn run(&self, cancel: CancellationToken) -> WorkerResult<SchedulerExit> {
        let mut wake_rx = self.wake_rx.try_lock().map_err(|_| {
            WorkerError::InvalidState(format!("scheduler '{}' is already running", self.name))
        })?;

        info!(
            scheduler = %self.name,
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Scheduler started"
        );

        self.drain_or_stop(&cancel).await?;

        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let source = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(scheduler = %self.name, stats = ?self.stats(), "Scheduler cancelled");
                    return Ok(SchedulerExit::Cancelled);
                }
                Some(()) = wake_rx.recv() => WakeSource::Trigger,
                _ = ticker.tick() => WakeSource::Timer,
            };

            match source {
                WakeSource::Timer => self.stats.timer_wakes.fetch_add(1, Ordering::Relaxed),
                WakeSource::Trigger => self.stats.trigger_wakes.fetch_add(1, Ordering::Relaxed),
            };
            debug!(scheduler = %self.name, source = ?source, "Wake received");

            self.drain_or_stop(&cancel).await?;
        }
    }

    async fn drain_or_stop(&self, cancel: &CancellationToken) -> WorkerResult<DrainReport> {
        self.drain(cancel).await.inspect_err(|e| {
            error!(scheduler = %self.name, error = %e, "Drain failed, scheduler stopping");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BatchFailureKind;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Scripted processor: pops outcomes, then reports nothing left
    #[derive(Default)]
    struct ScriptedProcessor {
        script: Mutex<VecDeque<WorkerResult<BatchOutcome>>>,
        calls: AtomicU64,
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    impl ScriptedProcessor {
        fn with_script(outcomes: Vec<WorkerResult<BatchOutcome>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchProcessor for ScriptedProcessor {
        async fn process_batch(&self, _max_batch_size: usize) -> WorkerResult<BatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Ok(BatchOutcome::NothingLeft))
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            batch_size: 10,
        }
    }

    fn fatal() -> WorkerError {
        WorkerError::BatchFailed {
            kind: BatchFailureKind::Fatal,
            attempts: 1,
            source: StoreError::Connection("connection refused".into()),
        }
    }

    #[tokio::test]
    async fn test_drain_runs_until_nothing_left() {
        let processor = Arc::new(ScriptedProcessor::with_script(vec![
            Ok(BatchOutcome::Processed(10)),
            Ok(BatchOutcome::Processed(10)),
            Ok(BatchOutcome::Processed(5)),
        ]));
        let scheduler = Scheduler::new("test", Arc::clone(&processor), config());

        let report = scheduler.drain(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.items, 25);
        assert_eq!(report.outcome, DrainOutcome::Exhausted);
        assert_eq!(processor.calls(), 4);
        assert_eq!(scheduler.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_drain_stops_between_batches_when_cancelled() {
        let processor = Arc::new(ScriptedProcessor::with_script(vec![Ok(
            BatchOutcome::Processed(10),
        )]));
        let scheduler = Scheduler::new("test", Arc::clone(&processor), config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler.drain(&cancel).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Cancelled);
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_drain_is_skipped() {
        let gate = Arc::new(Notify::new());
        let processor = Arc::new(ScriptedProcessor::gated(Arc::clone(&gate)));
        let scheduler = Arc::new(Scheduler::new("test", Arc::clone(&processor), config()));
        let cancel = CancellationToken::new();

        let first = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.drain(&cancel).await })
        };
        processor.entered.notified().await;
        assert_eq!(scheduler.run_state(), RunState::Running);

        let second = scheduler.drain(&cancel).await.unwrap();
        assert_eq!(second.outcome, DrainOutcome::Skipped);

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.outcome, DrainOutcome::Exhausted);
        assert_eq!(scheduler.stats().drains_skipped, 1);
        assert_eq!(scheduler.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_wakes_during_drain_cause_one_follow_up_drain() {
        let gate = Arc::new(Notify::new());
        let processor = Arc::new(ScriptedProcessor::gated(Arc::clone(&gate)));
        let scheduler = Arc::new(Scheduler::new("test", Arc::clone(&processor), config()));
        let cancel = CancellationToken::new();

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        // Initial drain is in flight
        processor.entered.notified().await;
        assert_eq!(scheduler.wake(), WakeOutcome::Delivered);
        assert_eq!(scheduler.wake(), WakeOutcome::Coalesced);
        gate.notify_one();

        // Exactly one follow-up drain
        processor.entered.notified().await;
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(processor.calls(), 2);
        assert_eq!(scheduler.stats().drains, 2);
        assert_eq!(scheduler.stats().trigger_wakes, 1);
        assert_eq!(scheduler.stats().coalesced_wakes, 1);

        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), SchedulerExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_triggers_drain() {
        let processor = Arc::new(ScriptedProcessor::default());
        let scheduler = Arc::new(Scheduler::new(
            "test",
            Arc::clone(&processor),
            SchedulerConfig {
                interval: Duration::from_secs(30),
                batch_size: 10,
            },
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.timer_wakes, 3);
        assert_eq!(stats.drains, 4);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_run_loop() {
        let processor = Arc::new(ScriptedProcessor::with_script(vec![
            Ok(BatchOutcome::Processed(3)),
            Err(fatal()),
        ]));
        let scheduler = Scheduler::new("test", Arc::clone(&processor), config());

        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.batch_failure_kind(), Some(BatchFailureKind::Fatal));
        assert_eq!(scheduler.run_state(), RunState::Idle);
        assert_eq!(scheduler.stats().items, 3);
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let processor = Arc::new(ScriptedProcessor::default());
        let scheduler = Scheduler::new("test", Arc::clone(&processor), config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(1), scheduler.run(cancel))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, SchedulerExit::Cancelled);
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test]
    async fn test_second_run_on_same_scheduler_is_rejected() {
        let gate = Arc::new(Notify::new());
        let processor = Arc::new(ScriptedProcessor::gated(Arc::clone(&gate)));
        let scheduler = Arc::new(Scheduler::new("test", Arc::clone(&processor), config()));
        let cancel = CancellationToken::new();

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };
        processor.entered.notified().await;

        let err = scheduler.run(cancel.clone()).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidState(_)));

        cancel.cancel();
        gate.notify_one();
        handle.await.unwrap().unwrap();
    }
}
