//! Uplink publisher - turns readings into remote database writes
//!
//! Each reading produces up to two writes:
//!
//! 1. A log append under `<bin_id>/logs` when the reading reports a
//!    detection (`materialDetected` present and not `None`)
//! 2. A state merge into `<bin_id>` with everything but `materialDetected`
//!
//! Each write is retried on its own, so a log entry that was acknowledged is
//! not appended again when the following state merge has to be retried.
//!
//! # Delivery states
//!
//! ```text
//! Received → Queued → Publishing ─┬─► Acked
//!                        ▲        ├─► Dropped
//!                        └─ Retrying ◄┘
//! ```

use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{RetryConfig, UplinkConfig};
use crate::database::RemoteDatabase;
use crate::error::{BridgeError, Result};
use crate::reading::TelemetryReading;

/// Lifecycle of one reading inside the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Parsed from a frame
    Received,
    /// Buffered in the delivery queue
    Queued,
    /// A remote write is in flight
    Publishing,
    /// Waiting out a backoff delay after a transient failure
    Retrying,
    /// All writes acknowledged
    Acked,
    /// Given up on; see the logged reason
    Dropped,
}

impl DeliveryState {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Dropped)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Received => write!(f, "received"),
            DeliveryState::Queued => write!(f, "queued"),
            DeliveryState::Publishing => write!(f, "publishing"),
            DeliveryState::Retrying => write!(f, "retrying"),
            DeliveryState::Acked => write!(f, "acked"),
            DeliveryState::Dropped => write!(f, "dropped"),
        }
    }
}

/// Terminal result of publishing one reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Every write succeeded
    Acked {
        /// Generated id of the log entry, when one was written
        log_id: Option<String>,
    },
    /// The reading was dropped
    Dropped {
        /// Error code of the failure that ended delivery
        code: &'static str,
    },
}

impl PublishOutcome {
    /// Terminal delivery state this outcome represents
    pub fn state(&self) -> DeliveryState {
        match self {
            PublishOutcome::Acked { .. } => DeliveryState::Acked,
            PublishOutcome::Dropped { .. } => DeliveryState::Dropped,
        }
    }
}

/// Publisher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Readings fully acknowledged
    pub acked: u64,
    /// Readings dropped after a permanent failure
    pub dropped_permanent: u64,
    /// Readings dropped after running out of retries
    pub dropped_exhausted: u64,
    /// Readings dropped because shutdown cut retries short
    pub abandoned: u64,
    /// Log entries appended
    pub log_entries: u64,
    /// State merges applied
    pub state_updates: u64,
    /// Retry attempts made after transient failures
    pub retries: u64,
}

impl PublishStats {
    /// All readings that reached a terminal state
    pub fn published(&self) -> u64 {
        self.acked + self.dropped()
    }

    /// All dropped readings
    pub fn dropped(&self) -> u64 {
        self.dropped_permanent + self.dropped_exhausted + self.abandoned
    }
}

/// Publishes readings to a [`RemoteDatabase`] with retry and backoff
pub struct UplinkPublisher<D> {
    database: D,
    state_path: String,
    logs_path: String,
    retry: RetryConfig,
    abandon: Option<watch::Receiver<bool>>,
    stats: PublishStats,
}

impl<D: RemoteDatabase> UplinkPublisher<D> {
    /// Create a publisher writing under the configured bin id
    pub fn new(database: D, config: &UplinkConfig) -> Self {
        Self {
            database,
            state_path: config.state_path(),
            logs_path: config.logs_path(),
            retry: config.retry.clone(),
            abandon: None,
            stats: PublishStats::default(),
        }
    }

    /// Stop retrying once `true` is sent on this channel
    pub fn with_abandon_signal(mut self, abandon: watch::Receiver<bool>) -> Self {
        self.abandon = Some(abandon);
        self
    }

    /// The database writes go to
    pub fn database(&self) -> &D {
        &self.database
    }

    /// Counters so far
    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    /// Deliver one reading
    pub async fn publish(&mut self, reading: TelemetryReading) -> PublishOutcome {
        debug!(state = %DeliveryState::Publishing, "Publishing reading");

        let mut log_id = None;
        if let Some(entry) = reading.log_entry() {
            let database = &self.database;
            let path = self.logs_path.as_str();
            let record = &entry;
            let result = with_retry(
                "append_log_entry",
                &self.retry,
                &mut self.abandon,
                &mut self.stats,
                move || database.append_log_entry(path, record),
            )
            .await;

            match result {
                Ok(id) => {
                    self.stats.log_entries += 1;
                    info!(
                        material = %entry.material,
                        status = %entry.status,
                        id = %id,
                        "Logged new detection"
                    );
                    log_id = Some(id);
                }
                Err(e) => return self.drop_reading(e),
            }
        }

        let update = reading.state_update();
        let database = &self.database;
        let path = self.state_path.as_str();
        let fields = update.fields();
        let result = with_retry(
            "merge_update",
            &self.retry,
            &mut self.abandon,
            &mut self.stats,
            move || database.merge_update(path, fields),
        )
        .await;

        if let Err(e) = result {
            return self.drop_reading(e);
        }

        self.stats.state_updates += 1;
        self.stats.acked += 1;
        info!(
            path = %self.state_path,
            keys = update.fields().len(),
            "Bin state updated"
        );
        debug!(state = %DeliveryState::Acked, "Reading delivered");
        PublishOutcome::Acked { log_id }
    }

    fn drop_reading(&mut self, err: BridgeError) -> PublishOutcome {
        match &err {
            BridgeError::Abandoned(_) => self.stats.abandoned += 1,
            e if e.is_remote_transient() => self.stats.dropped_exhausted += 1,
            _ => self.stats.dropped_permanent += 1,
        }
        error!(
            code = err.error_code(),
            error = %err,
            dropped_total = self.stats.dropped(),
            state = %DeliveryState::Dropped,
            "Dropping reading"
        );
        PublishOutcome::Dropped {
            code: err.error_code(),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out
async fn with_retry<T, F, Fut>(
    op_name: &'static str,
    retry: &RetryConfig,
    abandon: &mut Option<watch::Receiver<bool>>,
    stats: &mut PublishStats,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::for_retry(retry);
    let mut retries = 0u32;

    loop {
        let attempt = tokio::time::timeout(retry.attempt_timeout, op())
            .await
            .unwrap_or_else(|_| {
                Err(BridgeError::AttemptTimeout {
                    duration_ms: retry.attempt_timeout.as_millis() as u64,
                })
            });

        let err = match attempt {
            Ok(value) => return Ok(value),
            Err(e) if e.is_remote_transient() => e,
            Err(e) => return Err(e),
        };

        if retry.max_retries.is_some_and(|max| retries >= max) {
            warn!(op = op_name, retries, error = %err, "Retries exhausted");
            return Err(err);
        }

        let delay = backoff.next_delay();
        retries += 1;
        stats.retries += 1;
        warn!(
            op = op_name,
            attempt = retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            state = %DeliveryState::Retrying,
            "Remote write failed, retrying"
        );

        if pause(delay, abandon).await {
            return Err(BridgeError::Abandoned(format!(
                "{} after {} retries: {}",
                op_name, retries, err
            )));
        }
    }
}

/// Sleep for `delay`; returns `true` if abandoned first
async fn pause(delay: std::time::Duration, abandon: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = abandon else {
        tokio::time::sleep(delay).await;
        return false;
    };
    if *rx.borrow() {
        return true;
    }

    let abandoned = async {
        loop {
            if rx.changed().await.is_err() {
                // Sender gone, nobody can abandon us any more
                std::future::pending::<()>().await;
            }
            if *rx.borrow_and_update() {
                return;
            }
        }
    };

    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = abandoned => true,
    }
}
