//! Serial link implementations for the bin controller
//!
//! - [`SerialInterface`] - tokio-serial port (requires `serial` feature)
//! - [`discovery`] - USB serial device detection (requires `serial` feature)
//!
//! Tests drive the bridge through [`crate::test_utils::MockSerialLink`].
//!
//! # Feature Requirements
//!
//! `serial` builds `serialport` without libudev, so no system packages are
//! needed. Device discovery then relies on sysfs on Linux.

#[cfg(feature = "serial")]
pub mod discovery;
#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Byte-stream connection to the bin controller
///
/// Framing is not the link's concern: a chunk may hold several lines or
/// part of one.
#[async_trait]
pub trait SerialLink: Send {
    /// Open the connection
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read whatever bytes are available
    ///
    /// Returns `None` when the read timeout expires without data.
    /// Returns `Err` on connection/read errors.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Get the link name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
