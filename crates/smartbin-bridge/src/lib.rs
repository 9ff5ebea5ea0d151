//! Smart-bin telemetry bridge
//!
//! Reads JSON telemetry that a bin controller (an Arduino sorting plastic
//! and metal) writes to a serial port, and publishes it to a real-time
//! database: a shallow merge into the bin's state node on every reading and
//! an append under its logs node for every detection.
//!
//! # Architecture
//!
//! 1. **Serial link** - [`SerialLink`] byte stream with reconnect
//! 2. **Framing** - [`FrameDecoder`] extracts `ARDUINO_DATA:`-tagged lines
//! 3. **Parsing** - [`TelemetryReading`] validates the JSON payload
//! 4. **Queueing** - bounded [`DeliveryQueue`] between ingestion and uplink
//! 5. **Uplink** - [`UplinkPublisher`] writes to a [`RemoteDatabase`] with retry
//!
//! [`TelemetryBridge`] supervises all of it.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: smartbin-bridge = { version = "0.1", features = ["serial"] }
//! use smartbin_bridge::{MemoryDatabase, TelemetryBridge, TelemetryConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TelemetryConfigBuilder::new()
//!         .serial_port_with_baud("/dev/ttyACM0", 9600)
//!         .bin_id("bin1")
//!         .build();
//!
//!     let (bridge, handle) = TelemetryBridge::with_serial(MemoryDatabase::new(), config);
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.shutdown();
//!     });
//!
//!     let report = bridge.run().await?;
//!     println!("acked {} readings", report.publish.acked);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - tokio-serial link and USB device discovery
//!
//! # Wire format
//!
//! One reading per line:
//!
//! ```text
//! ARDUINO_DATA:{"materialDetected":"Plastic","plastic":{"status":"Full","level":92}}
//! ```
//!
//! Lines without the prefix are controller debug output and are skipped.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Serial side
pub mod config;
pub mod error;
pub mod frame;
pub mod interface;
pub mod reading;

// Delivery
pub mod backoff;
pub mod database;
pub mod publisher;
pub mod queue;

// Supervision
pub mod bridge;

// Testing utilities
pub mod test_utils;

pub use config::{
    FrameConfig, OverflowPolicy, QueueConfig, ReconnectConfig, RetryConfig, SerialConfig,
    SupervisorConfig, TelemetryConfig, TelemetryConfigBuilder, UplinkConfig,
};
pub use error::{BridgeError, ParseError, Result};
pub use interface::{ConnectionState, SerialLink};

#[cfg(feature = "serial")]
pub use interface::discovery::{find_controller_device, list_available_devices, DeviceInfo};
#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use frame::{DecoderStats, FrameDecoder};
pub use reading::{LogEntry, Material, StateUpdate, TelemetryReading};

pub use backoff::Backoff;
pub use database::{validate_path, MemoryDatabase, RemoteDatabase};
pub use publisher::{DeliveryState, PublishOutcome, PublishStats, UplinkPublisher};
pub use queue::{DeliveryQueue, EnqueueOutcome, QueueStats};

pub use bridge::{BridgeHandle, BridgeReport, IngestStats, TelemetryBridge};

pub use test_utils::{FailureKind, FlakyDatabase, MockSerialLink};

pub use config::{
    AUTO_PORT, DEFAULT_BAUD_RATE, DEFAULT_BIN_ID, DEFAULT_FRAME_PREFIX, DEFAULT_QUEUE_CAPACITY,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
