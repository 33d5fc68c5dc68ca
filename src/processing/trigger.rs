//! # Coalescing Wake Trigger
//!
//! A single-slot signal between wake sources (notification listener, callers
//! of [`Scheduler::wake`](super::scheduler::Scheduler::wake)) and one scheduler.
//! At most one wake is ever pending: a wake sent while another is pending is
//! dropped, so any number of wakes during a drain collapse into one follow-up
//! drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Result of a wake attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The slot was empty and now holds a wake
    Delivered,
    /// A wake was already pending; this one merged into it
    Coalesced,
    /// The scheduler is gone
    Closed,
}

#[derive(Debug, Default)]
struct TriggerStats {
    delivered: AtomicU64,
    coalesced: AtomicU64,
}

/// Snapshot of trigger counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStatsSnapshot {
    pub delivered: u64,
    pub coalesced: u64,
}

/// Sending half; cheap to clone and content-free
#[derive(Debug, Clone)]
pub struct WakeSender {
    tx: mpsc::Sender<()>,
    stats: Arc<TriggerStats>,
}

/// Receiving half, owned by the scheduler loop
#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<()>,
}

/// Create a coalescing wake channel
pub fn wake_channel() -> (WakeSender, WakeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        WakeSender {
            tx,
            stats: Arc::new(TriggerStats::default()),
        },
        WakeReceiver { rx },
    )
}

impl WakeSender {
    /// Fire-and-forget wake; never blocks
    pub fn wake(&self) -> WakeOutcome {
        match self.tx.try_send(()) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                WakeOutcome::Delivered
            }
            Err(TrySendError::Full(())) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                WakeOutcome::Coalesced
            }
            Err(TrySendError::Closed(())) => WakeOutcome::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> TriggerStatsSnapshot {
        TriggerStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
        }
    }
}

impl WakeReceiver {
    /// Wait for the pending wake; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}
