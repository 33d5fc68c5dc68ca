//! # Notification Listener
//!
//! Turns PostgreSQL `NOTIFY` messages on the configured channel into
//! coalescing wakes for every scheduler in the process. The payload is only
//! logged. Delivery is advisory: a lost notification delays work until the
//! next timer tick, and a burst of notifications collapses into one drain per
//! scheduler.
//!
//! Connection and receive errors are logged and retried after a fixed delay;
//! the listener never stops the worker. It returns when the cancellation token
//! fires.

use futures::StreamExt;
use serde::Serialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::defaults;
use crate::error::{WorkerError, WorkerResult};
use crate::processing::{WakeOutcome, WakeSender};

#[derive(Debug, Default)]
struct ListenerStats {
    connections: AtomicU64,
    notifications: AtomicU64,
    wakes_delivered: AtomicU64,
    wakes_coalesced: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time listener counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStatsSnapshot {
    pub connections: u64,
    pub notifications: u64,
    pub wakes_delivered: u64,
    pub wakes_coalesced: u64,
    pub errors: u64,
}

/// How one notification was fanned out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub coalesced: usize,
    pub closed: usize,
}

/// Wake every trigger once
pub fn fan_out(wakers: &[WakeSender]) -> FanOut {
    wakers
        .iter()
        .fold(FanOut::default(), |mut acc, waker| {
            match waker.wake() {
                WakeOutcome::Delivered => acc.delivered += 1,
                WakeOutcome::Coalesced => acc.coalesced += 1,
                WakeOutcome::Closed => acc.closed += 1,
            }
            acc
        })
}

/// LISTEN/NOTIFY wake source
pub struct NotificationListener {
    listener_id: Uuid,
    pool: PgPool,
    channel: String,
    wakers: Vec<WakeSender>,
    retry_delay: Duration,
    stats: Arc<ListenerStats>,
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("listener_id", &self.listener_id)
            .field("channel", &self.channel)
            .field("wakers", &self.wakers.len())
            .finish()
    }
}

impl NotificationListener {
    pub fn new(pool: PgPool, channel: impl Into<String>, wakers: Vec<WakeSender>) -> Self {
        Self {
            listener_id: Uuid::new_v4(),
            pool,
            channel: channel.into(),
            wakers,
            retry_delay: defaults::LISTENER_RETRY_DELAY,
            stats: Arc::new(ListenerStats::default()),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            connections: self.stats.connections.load(Ordering::Relaxed),
            notifications: self.stats.notifications.load(Ordering::Relaxed),
            wakes_delivered: self.stats.wakes_delivered.load(Ordering::Relaxed),
            wakes_coalesced: self.stats.wakes_coalesced.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Listen until cancelled, reconnecting after errors
    #[instrument(skip(self, cancel), fields(listener_id = %self.listener_id, channel = %self.channel))]
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.listen_until_error(&cancel) => result,
            };
            match result {
                Ok(()) => break,
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Notification listener failed, timer remains the fallback"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
        info!(stats = ?self.stats(), "Notification listener stopped");
    }

    async fn listen_until_error(&self, cancel: &CancellationToken) -> WorkerResult<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        info!("Listening for work notifications");

        let mut notifications = listener.into_stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = notifications.next() => match next {
                    Some(Ok(notification)) => {
                        self.on_notification(notification.payload());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(WorkerError::Listener(
                            "notification stream ended".to_string(),
                        ))
                    }
                },
            }
        }
    }

    fn on_notification(&self, payload: &str) -> FanOut {
        self.stats.notifications.fetch_add(1, Ordering::Relaxed);
        let outcome = fan_out(&self.wakers);
        self.stats
            .wakes_delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .wakes_coalesced
            .fetch_add(outcome.coalesced as u64, Ordering::Relaxed);
        debug!(
            payload_len = payload.len(),
            delivered = outcome.delivered,
            coalesced = outcome.coalesced,
            "Work notification received"
        );
        outcome
    }
}
