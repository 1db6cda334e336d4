//! Dispatch queue: ordered, paced delivery of new entries to the sink.

use crate::db::{self, CursorWrite, Pool, RegistryError};
use crate::model::{DiaryEntry, Notification, TrackedUser};
use crate::pipeline::retry::RetryPolicy;
use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Sink rejection classification.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Explicit "try later" signal, optionally carrying the sink's own
    /// retry-after hint.
    #[error("sink temporarily rejected the send")]
    Transient { retry_after: Option<Duration> },
    /// The destination no longer exists; pending tickets for it are dropped
    /// and the destination is reported upward for deactivation.
    #[error("destination no longer exists")]
    Gone,
}

/// The output side of the pipeline: one formatted-notification request per
/// delivered entry. Rendering happens behind this trait.
#[async_trait]
pub trait Sink: Send + Sync + Any {
    async fn send(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// How a user's batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Complete,
    /// A ticket was dropped (retry ceiling, stale cursor, or removal race);
    /// the rest of the batch is left for the next cycle to re-derive.
    Abandoned,
    DestinationGone,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub outcome: BatchOutcome,
}

/// Delivers tickets for one user strictly oldest-first, advancing the
/// registry cursor after each successful send. Sends to one destination are
/// serialized and paced even when several tracked users share it.
pub struct Dispatcher {
    sink: Arc<dyn Sink>,
    send_spacing: Duration,
    retry: RetryPolicy,
    /// Per-destination serialization point, remembering the last send time so
    /// spacing holds across batches, not just within one.
    destinations: Mutex<HashMap<i64, Arc<Mutex<Option<Instant>>>>>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn Sink>, send_spacing: Duration, retry: RetryPolicy) -> Self {
        Self {
            sink,
            send_spacing,
            retry,
            destinations: Mutex::new(HashMap::new()),
        }
    }

    async fn pacing_for(&self, destination_id: i64) -> Arc<Mutex<Option<Instant>>> {
        let mut destinations = self.destinations.lock().await;
        destinations
            .entry(destination_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Send one ticket, retrying transient rejections with backoff up to the
    /// configured ceiling.
    async fn send_ticket(&self, notification: &Notification) -> Result<(), SinkError> {
        let mut attempt = 0u32;
        loop {
            match self.sink.send(notification).await {
                Ok(()) => return Ok(()),
                Err(SinkError::Gone) => return Err(SinkError::Gone),
                Err(SinkError::Transient { retry_after }) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(SinkError::Transient { retry_after });
                    }
                    let delay = retry_after.unwrap_or_else(|| self.retry.delay_for(attempt - 1));
                    warn!(
                        username = %notification.username,
                        destination = notification.destination_id,
                        entry = notification.entry.id,
                        attempt,
                        "sink rejected send; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Deliver a batch of verified-new entries (oldest-first) for one user.
    /// Cursor advancement is per entry, so a partial failure loses the
    /// minimum possible ground.
    #[instrument(skip_all, fields(username = %user.username, destination = user.destination_id))]
    pub async fn deliver_batch(
        &self,
        pool: &Pool,
        user: &TrackedUser,
        entries: Vec<DiaryEntry>,
    ) -> Result<DeliveryReport> {
        let pacing = self.pacing_for(user.destination_id).await;
        let mut last_send = pacing.lock().await;

        let mut delivered = 0usize;
        for entry in entries {
            if let Some(prev) = *last_send {
                let since = prev.elapsed();
                if since < self.send_spacing {
                    tokio::time::sleep(self.send_spacing - since).await;
                }
            }

            let cursor = entry.cursor();
            let notification = Notification {
                username: user.username.clone(),
                destination_id: user.destination_id,
                entry,
            };

            let sent = self.send_ticket(&notification).await;
            *last_send = Some(Instant::now());
            match sent {
                Ok(()) => {}
                Err(SinkError::Gone) => {
                    warn!(
                        entry = notification.entry.id,
                        "destination gone; dropping pending tickets"
                    );
                    return Ok(DeliveryReport {
                        delivered,
                        outcome: BatchOutcome::DestinationGone,
                    });
                }
                Err(SinkError::Transient { .. }) => {
                    // Cursor untouched: the entry is re-derived next cycle.
                    warn!(
                        entry = notification.entry.id,
                        "send attempts exhausted; dropping ticket until next cycle"
                    );
                    return Ok(DeliveryReport {
                        delivered,
                        outcome: BatchOutcome::Abandoned,
                    });
                }
            }

            // Membership is re-checked by the write itself: a removed user's
            // row no longer matches and the advance is discarded.
            match db::advance_cursor(pool, user.id, cursor).await {
                Ok(CursorWrite::Advanced) => {
                    delivered += 1;
                    info!(
                        entry = notification.entry.id,
                        show = %notification.entry.show_name,
                        "delivered diary entry"
                    );
                }
                Ok(CursorWrite::Discarded) => {
                    debug!("user removed mid-batch; discarding remaining tickets");
                    return Ok(DeliveryReport {
                        delivered,
                        outcome: BatchOutcome::Abandoned,
                    });
                }
                Err(RegistryError::StaleCursor { .. }) => {
                    // Invariant violation, not expected in normal operation;
                    // abort this user's writes without failing the cycle.
                    error!(
                        entry = notification.entry.id,
                        "stale cursor write; aborting batch"
                    );
                    return Ok(DeliveryReport {
                        delivered,
                        outcome: BatchOutcome::Abandoned,
                    });
                }
                Err(RegistryError::Db(err)) => return Err(err.into()),
            }
        }

        Ok(DeliveryReport {
            delivered,
            outcome: BatchOutcome::Complete,
        })
    }
}
