//! Configuration types for the smart-bin bridge
//!
//! This module provides configuration structures for the serial link, frame
//! decoding, the delivery queue, the uplink publisher and reconnection.
//! Every section has serde defaults so a partial JSON file is enough.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Prefix the bin firmware prints before each JSON status line
pub const DEFAULT_FRAME_PREFIX: &str = "ARDUINO_DATA:";

/// Default baud rate of the bin firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default serial read timeout
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Default cap on a buffered partial line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default delivery queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default remote path root
pub const DEFAULT_BIN_ID: &str = "bin1";

/// Child node under the bin path holding detection logs
pub const LOGS_CHILD: &str = "logs";

/// Serial port value that requests device auto-detection
pub const AUTO_PORT: &str = "auto";

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Frame decoding settings
    #[serde(default)]
    pub frame: FrameConfig,

    /// Delivery queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Uplink publisher settings
    #[serde(default)]
    pub uplink: UplinkConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Serial port connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Path to serial port (e.g., /dev/ttyACM0, COM7), or `auto`
    #[serde(default = "default_port")]
    pub port: PathBuf,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Read timeout; expiry is not an error
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Pause after opening the port (the board resets on open)
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
}

fn default_port() -> PathBuf {
    PathBuf::from("/dev/ttyACM0")
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: default_read_timeout(),
            settle_delay: default_settle_delay(),
        }
    }
}

impl SerialConfig {
    /// Whether the port should be discovered at startup
    pub fn is_auto(&self) -> bool {
        self.port.as_os_str() == AUTO_PORT
    }
}

/// Frame decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Marker that starts every line of interest
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Longest partial line kept while waiting for a terminator
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_prefix() -> String {
    DEFAULT_FRAME_PREFIX.to_string()
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// What the queue does when a reading arrives and it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered reading (live data favors recency)
    #[default]
    DropOldest,
    /// Wait for the publisher to make room
    Block,
}

/// Delivery queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum buffered readings
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Behavior under sustained overflow
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Uplink publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Remote path root for this bin
    #[serde(default = "default_bin_id")]
    pub bin_id: String,

    /// Retry behavior for remote writes
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_bin_id() -> String {
    DEFAULT_BIN_ID.to_string()
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            bin_id: default_bin_id(),
            retry: RetryConfig::default(),
        }
    }
}

impl UplinkConfig {
    /// Path receiving bin state merges
    pub fn state_path(&self) -> String {
        self.bin_id.clone()
    }

    /// Path receiving detection log appends
    pub fn logs_path(&self) -> String {
        format!("{}/{}", self.bin_id, LOGS_CHILD)
    }
}

/// Retry behavior for a single remote write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "humantime_serde", default = "default_retry_base")]
    pub base_delay: Duration,

    /// Upper bound on the delay between retries
    #[serde(with = "humantime_serde", default = "default_retry_cap")]
    pub max_delay: Duration,

    /// Retries after the first attempt; `None` retries until shutdown
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Deadline for each attempt
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,

    /// Add up to 10% random jitter to each delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_retry_base() -> Duration {
    Duration::from_millis(200)
}

fn default_retry_cap() -> Duration {
    Duration::from_secs(5)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_retry_base(),
            max_delay: default_retry_cap(),
            max_retries: None,
            attempt_timeout: default_attempt_timeout(),
            jitter: true,
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Initial delay before first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,

    /// A buffered partial frame survives a reconnect that finishes within this window
    #[serde(with = "humantime_serde", default = "default_partial_frame_window")]
    pub partial_frame_window: Duration,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_partial_frame_window() -> Duration {
    Duration::from_secs(5)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts: 0, // Infinite
            partial_frame_window: default_partial_frame_window(),
        }
    }
}

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long the publisher may keep draining after shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Interval between counter reports in the log
    #[serde(with = "humantime_serde", default = "default_stats_interval")]
    pub stats_interval: Duration,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl TelemetryConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.as_os_str().is_empty() {
            return Err(BridgeError::MissingConfig("serial.port".to_string()));
        }
        if self.serial.baud_rate == 0 {
            return Err(BridgeError::InvalidConfig(
                "serial.baud_rate must be positive".to_string(),
            ));
        }
        if self.serial.read_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "serial.read_timeout must be positive".to_string(),
            ));
        }
        if self.frame.prefix.is_empty() {
            return Err(BridgeError::MissingConfig("frame.prefix".to_string()));
        }
        if self.frame.prefix.contains('\n') {
            return Err(BridgeError::InvalidConfig(
                "frame.prefix must not contain a line break".to_string(),
            ));
        }
        if self.frame.max_line_length <= self.frame.prefix.len() {
            return Err(BridgeError::InvalidConfig(
                "frame.max_line_length must exceed the prefix length".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "queue.capacity must be at least 1".to_string(),
            ));
        }
        if self.uplink.bin_id.is_empty() {
            return Err(BridgeError::MissingConfig("uplink.bin_id".to_string()));
        }
        if self.uplink.retry.attempt_timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "uplink.retry.attempt_timeout must be positive".to_string(),
            ));
        }
        if self.uplink.retry.base_delay > self.uplink.retry.max_delay {
            return Err(BridgeError::InvalidConfig(
                "uplink.retry.base_delay exceeds max_delay".to_string(),
            ));
        }
        if self.supervisor.stats_interval.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "supervisor.stats_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for TelemetryConfig
#[derive(Debug, Default)]
pub struct TelemetryConfigBuilder {
    config: TelemetryConfig,
}

impl TelemetryConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.serial.port = port.into();
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.serial.port = port.into();
        self.config.serial.baud_rate = baud_rate;
        self
    }

    /// Set the serial read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial.read_timeout = timeout;
        self
    }

    /// Set the post-open settle delay
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.serial.settle_delay = delay;
        self
    }

    /// Set the frame prefix marker
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.frame.prefix = prefix.into();
        self
    }

    /// Set the partial line cap
    pub fn max_line_length(mut self, len: usize) -> Self {
        self.config.frame.max_line_length = len;
        self
    }

    /// Set the queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue.capacity = capacity;
        self
    }

    /// Set the queue overflow policy
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.queue.overflow = policy;
        self
    }

    /// Set the remote path root
    pub fn bin_id(mut self, bin_id: impl Into<String>) -> Self {
        self.config.uplink.bin_id = bin_id.into();
        self
    }

    /// Bound the number of retries per remote write
    pub fn max_retries(mut self, retries: Option<u32>) -> Self {
        self.config.uplink.retry.max_retries = retries;
        self
    }

    /// Set the remote retry backoff range
    pub fn retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.config.uplink.retry.base_delay = base;
        self.config.uplink.retry.max_delay = cap;
        self
    }

    /// Set the per-attempt remote write deadline
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.uplink.retry.attempt_timeout = timeout;
        self
    }

    /// Enable or disable retry jitter
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.uplink.retry.jitter = enabled;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Set the reconnect backoff range
    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect.initial_delay = initial;
        self.config.reconnect.max_delay = max;
        self
    }

    /// Limit reconnect attempts (0 = infinite)
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Set the drain deadline after shutdown
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.supervisor.shutdown_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> TelemetryConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
