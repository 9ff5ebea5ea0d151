//! TelemetryBridge - serial ingestion and uplink supervision
//!
//! The bridge owns the serial link and runs two tasks joined by the
//! [`DeliveryQueue`]:
//!
//! - **Ingestion** (the `run` future itself): read → decode → parse → enqueue
//! - **Publishing** (a spawned task): dequeue → [`UplinkPublisher::publish`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        TelemetryBridge                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────┐   ┌──────────────┐   ┌───────────┐   ┌────────┐  │
//! │  │ SerialLink │──►│ FrameDecoder │──►│ Delivery  │──►│ Uplink │──┼─► RemoteDatabase
//! │  │ (reconnect)│   │ + parser     │   │ Queue     │   │ (retry)│  │
//! │  └────────────┘   └──────────────┘   └───────────┘   └────────┘  │
//! │        ▲                                                         │
//! │        └──── BridgeHandle::shutdown ─────────────────────────────┤
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Shutdown
//!
//! Ingestion stops reading and the queue is closed. The publisher drains
//! what is left for up to `shutdown_timeout`; after that it is told to
//! abandon retries, and whatever is still queued is reported as abandoned.
//!
//! # Example
//!
//! ```rust,ignore
//! use smartbin_bridge::{MemoryDatabase, TelemetryBridge, TelemetryConfigBuilder};
//!
//! let config = TelemetryConfigBuilder::new().serial_port("/dev/ttyACM0").build();
//! let (bridge, handle) = TelemetryBridge::with_serial(MemoryDatabase::new(), config);
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! });
//!
//! let report = bridge.run().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::TelemetryConfig;
use crate::database::RemoteDatabase;
use crate::error::{BridgeError, ParseError, Result};
use crate::frame::{DecoderStats, FrameDecoder};
use crate::interface::SerialLink;
use crate::publisher::{DeliveryState, PublishStats, UplinkPublisher};
use crate::queue::{DeliveryQueue, EnqueueOutcome, QueueStats};
use crate::reading::TelemetryReading;

#[cfg(feature = "serial")]
use crate::interface::SerialInterface;

/// Ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Bytes read from the link
    pub bytes_read: u64,
    /// Readings parsed and queued
    pub readings: u64,
    /// Frames that were not valid JSON
    pub malformed_frames: u64,
    /// Frames with valid JSON that failed validation
    pub invalid_readings: u64,
    /// Readings evicted from a full queue
    pub overflow_drops: u64,
    /// Readings lost because shutdown arrived while waiting for queue room
    pub shutdown_drops: u64,
    /// Mid-stream link failures
    pub link_errors: u64,
    /// Successful connects, the first one included
    pub connects: u64,
    /// Failed connect attempts
    pub connect_failures: u64,
}

/// Counters returned when the bridge stops
#[derive(Debug, Clone, Default)]
pub struct BridgeReport {
    /// Ingestion side
    pub ingest: IngestStats,
    /// Frame decoder
    pub decoder: DecoderStats,
    /// Delivery queue at exit
    pub queue: QueueStats,
    /// Publisher side
    pub publish: PublishStats,
    /// Readings still queued when the publisher was told to give up
    pub abandoned_in_queue: u64,
}

impl BridgeReport {
    /// Readings that never reached the database, for any reason
    pub fn lost(&self) -> u64 {
        self.ingest.overflow_drops
            + self.ingest.shutdown_drops
            + self.publish.dropped()
            + self.abandoned_in_queue
    }
}

/// Handle for controlling a running [`TelemetryBridge`]
#[derive(Clone)]
pub struct BridgeHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl BridgeHandle {
    /// Ask the bridge to stop; safe to call more than once
    pub fn shutdown(&self) {
        info!("Bridge shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Whether shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish()
    }
}

/// Supervisor for one serial link and one remote database
pub struct TelemetryBridge<L: SerialLink, D: RemoteDatabase + 'static> {
    link: L,
    decoder: FrameDecoder,
    queue: DeliveryQueue<TelemetryReading>,
    publisher: Option<UplinkPublisher<D>>,
    abandon_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    config: TelemetryConfig,
    stats: IngestStats,
}

impl<L: SerialLink, D: RemoteDatabase + 'static> TelemetryBridge<L, D> {
    /// Create a bridge over `link` that publishes into `database`
    pub fn new(link: L, database: D, config: TelemetryConfig) -> (Self, BridgeHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abandon_tx, abandon_rx) = watch::channel(false);

        let publisher = UplinkPublisher::new(database, &config.uplink).with_abandon_signal(abandon_rx);

        let bridge = Self {
            link,
            decoder: FrameDecoder::from_config(&config.frame),
            queue: DeliveryQueue::from_config(&config.queue),
            publisher: Some(publisher),
            abandon_tx,
            shutdown_rx,
            config,
            stats: IngestStats::default(),
        };
        let handle = BridgeHandle {
            shutdown_tx: Arc::new(shutdown_tx),
        };

        (bridge, handle)
    }

    /// Run until shutdown is requested or the link is given up on
    ///
    /// The link error that ended the run is returned after the publisher has
    /// drained; otherwise the final counters are.
    pub async fn run(mut self) -> Result<BridgeReport> {
        let publisher = self
            .publisher
            .take()
            .ok_or_else(|| BridgeError::Internal("bridge already ran".to_string()))?;
        self.config.validate()?;

        info!(
            link = self.link.name(),
            database = publisher.database().name(),
            bin_id = %self.config.uplink.bin_id,
            prefix = %self.decoder.prefix(),
            "Starting telemetry bridge"
        );

        let queue = self.queue.clone();
        let abandon_rx = self.abandon_tx.subscribe();
        let publisher_task = tokio::spawn(publish_loop(publisher, queue, abandon_rx));

        let outcome = self.ingest().await;

        if self.link.is_connected() {
            if let Err(e) = self.link.disconnect().await {
                warn!(error = %e, "Error disconnecting from serial link");
            }
        }

        let report = self.finish(publisher_task).await;
        match outcome {
            Ok(()) => {
                info!(
                    readings = report.ingest.readings,
                    acked = report.publish.acked,
                    lost = report.lost(),
                    "Telemetry bridge stopped"
                );
                Ok(report)
            }
            Err(e) => {
                error!(code = e.error_code(), error = %e, ?report, "Telemetry bridge failed");
                Err(e)
            }
        }
    }

    /// Ingestion loop; returns when shutdown is requested or the link is lost for good
    async fn ingest(&mut self) -> Result<()> {
        if !self.open_link().await? {
            return Ok(());
        }

        let period = self.config.supervisor.stats_interval;
        let mut stats_tick = tokio::time::interval_at(Instant::now() + period, period);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_signal(&mut self.shutdown_rx) => {
                    debug!("Ingestion stopping");
                    return Ok(());
                }

                chunk = self.link.read_chunk() => {
                    match chunk {
                        Ok(Some(bytes)) => {
                            self.stats.bytes_read += bytes.len() as u64;
                            self.decoder.push(&bytes);
                            if !self.drain_frames().await {
                                return Ok(());
                            }
                        }
                        Ok(None) => {
                            trace!("Serial read timed out");
                        }
                        Err(e) => {
                            if !self.recover_link(e).await? {
                                return Ok(());
                            }
                        }
                    }
                }

                _ = stats_tick.tick() => {
                    self.log_counters();
                }
            }
        }
    }

    /// Parse and enqueue every complete frame; `false` if shutdown interrupted
    async fn drain_frames(&mut self) -> bool {
        while let Some(frame) = self.decoder.next_frame() {
            let reading = match TelemetryReading::parse(&frame) {
                Ok(reading) => reading,
                Err(e) => {
                    self.reject_frame(e);
                    continue;
                }
            };

            debug!(
                state = %DeliveryState::Received,
                material = reading.material().map(|m| m.as_str()).unwrap_or("-"),
                "Reading received"
            );

            let enqueue = tokio::select! {
                outcome = self.queue.enqueue(reading) => Some(outcome),
                _ = shutdown_signal(&mut self.shutdown_rx) => None,
            };

            match enqueue {
                Some(Ok(EnqueueOutcome::Accepted)) => {
                    self.stats.readings += 1;
                    trace!(state = %DeliveryState::Queued, "Reading queued");
                }
                Some(Ok(EnqueueOutcome::Displaced(_))) => {
                    self.stats.readings += 1;
                    self.stats.overflow_drops += 1;
                    trace!(state = %DeliveryState::Queued, "Reading queued, oldest evicted");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Reading rejected by delivery queue");
                    self.stats.shutdown_drops += 1;
                }
                None => {
                    warn!("Shutdown while waiting for queue room, reading dropped");
                    self.stats.shutdown_drops += 1;
                    return false;
                }
            }
        }
        true
    }

    fn reject_frame(&mut self, err: ParseError) {
        if err.is_validation() {
            self.stats.invalid_readings += 1;
            warn!(
                code = err.error_code(),
                error = %err,
                invalid_total = self.stats.invalid_readings,
                "Dropping invalid reading"
            );
        } else {
            self.stats.malformed_frames += 1;
            warn!(
                code = err.error_code(),
                error = %err,
                malformed_total = self.stats.malformed_frames,
                "Dropping malformed frame"
            );
        }
    }

    /// Connect with backoff, then let the board settle
    ///
    /// Returns `false` if shutdown was requested first.
    async fn open_link(&mut self) -> Result<bool> {
        let mut backoff = Backoff::for_reconnect(&self.config.reconnect);
        let max_attempts = self.config.reconnect.max_attempts;

        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(false);
            }

            match self.link.connect().await {
                Ok(()) => {
                    self.stats.connects += 1;
                    info!(link = self.link.name(), "Serial link open");
                    break;
                }
                Err(e) => {
                    self.stats.connect_failures += 1;
                    let attempts = backoff.attempts() + 1;
                    if max_attempts > 0 && attempts >= max_attempts {
                        error!(attempts, error = %e, "Giving up on serial link");
                        return Err(e);
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to open serial link, retrying"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(false);
                    }
                }
            }
        }

        // The board resets when the port opens
        let settle = self.config.serial.settle_delay;
        if !settle.is_zero() {
            debug!(settle_ms = settle.as_millis() as u64, "Waiting for device to settle");
            if self.sleep_or_shutdown(settle).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reopen the link after a mid-stream failure
    ///
    /// Returns `false` if shutdown was requested while reconnecting.
    async fn recover_link(&mut self, cause: BridgeError) -> Result<bool> {
        self.stats.link_errors += 1;
        warn!(
            code = cause.error_code(),
            error = %cause,
            pending_bytes = self.decoder.pending_len(),
            "Serial link failed"
        );

        if !self.config.reconnect.enabled || !cause.is_retriable() {
            return Err(cause);
        }

        if let Err(e) = self.link.disconnect().await {
            debug!(error = %e, "Error closing failed link");
        }

        let started = Instant::now();
        if !self.open_link().await? {
            return Ok(false);
        }

        let window = self.config.reconnect.partial_frame_window;
        if started.elapsed() > window && self.decoder.pending_len() > 0 {
            info!(
                window_ms = window.as_millis() as u64,
                "Reconnect took too long, discarding partial frame"
            );
            self.decoder.discard_partial();
        }
        info!(connects = self.stats.connects, "Serial link recovered");
        Ok(true)
    }

    /// Sleep unless shutdown comes first; `true` means shutdown
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown_signal(&mut self.shutdown_rx) => true,
        }
    }

    fn log_counters(&self) {
        let decoder = self.decoder.stats();
        let queue = self.queue.stats();
        info!(
            bytes = self.stats.bytes_read,
            frames = decoder.frames,
            noise = decoder.noise_lines,
            readings = self.stats.readings,
            malformed = self.stats.malformed_frames,
            invalid = self.stats.invalid_readings,
            overflow_drops = self.stats.overflow_drops,
            queue_len = queue.len,
            published = queue.dequeued,
            link_errors = self.stats.link_errors,
            "Bridge counters"
        );
    }

    /// Close the queue and wait for the publisher within the shutdown budget
    async fn finish(&mut self, mut task: JoinHandle<(PublishStats, u64)>) -> BridgeReport {
        self.queue.close();
        let budget = self.config.supervisor.shutdown_timeout;
        info!(
            queued = self.queue.len(),
            timeout_ms = budget.as_millis() as u64,
            "Draining delivery queue"
        );

        let joined = match tokio::time::timeout(budget, &mut task).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                warn!(queued = self.queue.len(), "Shutdown timeout reached, abandoning retries");
                self.abandon_tx.send_replace(true);
                // An in-flight attempt is bounded by the attempt timeout
                let grace = self.config.uplink.retry.attempt_timeout;
                match tokio::time::timeout(grace, &mut task).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        error!("Publisher did not stop, aborting it");
                        task.abort();
                        None
                    }
                }
            }
        };

        let (publish, mut abandoned_in_queue) = match joined {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                error!(error = %e, "Publisher task failed");
                (PublishStats::default(), 0)
            }
            None => (PublishStats::default(), 0),
        };

        let leftover = abandon_queued(&self.queue);
        abandoned_in_queue += leftover;

        BridgeReport {
            ingest: self.stats,
            decoder: self.decoder.stats(),
            queue: self.queue.stats(),
            publish,
            abandoned_in_queue,
        }
    }
}

#[cfg(feature = "serial")]
impl<D: RemoteDatabase + 'static> TelemetryBridge<SerialInterface, D> {
    /// Create a bridge on the configured serial port
    ///
    /// A port of `auto` is resolved to the first Arduino-like USB device each
    /// time the link connects; no device yet is a retriable connect failure.
    pub fn with_serial(database: D, config: TelemetryConfig) -> (Self, BridgeHandle) {
        let link = SerialInterface::from_config(&config.serial);
        Self::new(link, database, config)
    }
}

/// Publishing task: deliver readings until the queue closes and drains
///
/// Returns the publisher counters and the number of readings left behind
/// after an abandon.
async fn publish_loop<D: RemoteDatabase>(
    mut publisher: UplinkPublisher<D>,
    queue: DeliveryQueue<TelemetryReading>,
    abandon: watch::Receiver<bool>,
) -> (PublishStats, u64) {
    while let Some(reading) = queue.dequeue().await {
        if *abandon.borrow() {
            let left = 1 + abandon_queued(&queue);
            return (publisher.stats(), left);
        }
        publisher.publish(reading).await;
    }
    debug!("Delivery queue drained");
    (publisher.stats(), 0)
}

/// Empty the queue, logging each reading as abandoned
fn abandon_queued(queue: &DeliveryQueue<TelemetryReading>) -> u64 {
    let mut count = 0;
    while let Some(reading) = queue.try_dequeue() {
        count += 1;
        warn!(
            material = reading.material().map(|m| m.as_str()).unwrap_or("-"),
            received_at = %reading.received_at(),
            "Abandoning queued reading"
        );
    }
    count
}

/// Resolves once `true` is observed; never resolves if the sender is gone
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
