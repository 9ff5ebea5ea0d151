//! Serial port link to the bin controller
//!
//! Async serial communication using tokio-serial. The port is opened 8N1
//! with no flow control; reads are bounded by the configured read timeout so
//! the supervisor gets control back regularly even on a silent line.
//!
//! A port of `auto` is looked up again on every connect, so a controller that
//! is plugged in late, or comes back under a new device node, is picked up by
//! the supervisor's reconnect backoff.

use crate::config::{SerialConfig, AUTO_PORT, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};
use crate::error::{BridgeError, Result};
use crate::interface::discovery::find_controller_device;
use crate::interface::{ConnectionState, SerialLink};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial link over a tokio-serial stream
pub struct SerialInterface {
    /// Serial port path; the last detected one when auto-detecting
    port_path: PathBuf,

    /// Re-run device discovery before each connect
    auto_detect: bool,

    /// Baud rate
    baud_rate: u32,

    /// Read timeout
    read_timeout: Duration,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Link name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial link
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());
        let auto_detect = port_path.as_os_str() == AUTO_PORT;

        Self {
            port_path,
            auto_detect,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            stream: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(&config.port)
            .with_baud_rate(config.baud_rate)
            .with_read_timeout(config.read_timeout)
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Create with custom read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the port is detected on each connect
    pub fn is_auto_detect(&self) -> bool {
        self.auto_detect
    }

    /// Pick the port to open, running `detect` when auto-detecting
    fn resolve_port(&mut self, detect: impl FnOnce() -> Option<String>) -> Result<()> {
        if !self.auto_detect {
            return Ok(());
        }

        let port = detect().ok_or_else(|| {
            BridgeError::PortNotFound("no Arduino-like serial device detected".to_string())
        })?;
        if self.port_path.as_path() != Path::new(&port) {
            info!(port = %port, "Auto-detected serial port");
        }
        self.port_path = PathBuf::from(port);
        Ok(())
    }
}

#[async_trait]
impl SerialLink for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        if let Err(e) = self.resolve_port(find_controller_device) {
            debug!(error = %e, "Serial device discovery failed");
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        // Device nodes only exist as paths on unix; COM ports do not
        #[cfg(unix)]
        {
            if !self.port_path.exists() {
                self.state = ConnectionState::Disconnected;
                return Err(BridgeError::PortNotFound(
                    self.port_path.display().to_string(),
                ));
            }
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.read_timeout)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                BridgeError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;

        info!(port = %self.port_path.display(), "Connected to bin controller");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }

        self.state = ConnectionState::Disconnected;
        info!(port = %self.port_path.display(), "Disconnected from serial port");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        let read = match tokio::time::timeout(self.read_timeout, stream.read(&mut buf)).await {
            Ok(read) => read,
            // Quiet line
            Err(_) => return Ok(None),
        };

        match read {
            Ok(0) => {
                // EOF - device unplugged
                self.state = ConnectionState::Disconnected;
                Err(BridgeError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.state = ConnectionState::Disconnected;
                Err(BridgeError::ReadError(e.to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_state() {
        let iface = SerialInterface::new("/dev/ttyACM0");
        assert_eq!(iface.state(), ConnectionState::Disconnected);
        assert!(!iface.is_connected());
    }

    #[test]
    fn test_interface_name() {
        let iface = SerialInterface::new("/dev/ttyACM0");
        assert_eq!(iface.name(), "serial:/dev/ttyACM0");
    }

    #[test]
    fn test_from_config() {
        let config = SerialConfig {
            port: PathBuf::from("/dev/ttyUSB3"),
            baud_rate: 115200,
            ..SerialConfig::default()
        };
        let iface = SerialInterface::from_config(&config);
        assert_eq!(iface.port_path(), Path::new("/dev/ttyUSB3"));
        assert_eq!(iface.baud_rate, 115200);
    }

    #[tokio::test]
    async fn test_read_without_connect() {
        let mut iface = SerialInterface::new("/dev/ttyACM0");
        assert!(matches!(
            iface.read_chunk().await,
            Err(BridgeError::Disconnected)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_port() {
        let mut iface = SerialInterface::new("/dev/smartbin-does-not-exist");
        assert!(matches!(
            iface.connect().await,
            Err(BridgeError::PortNotFound(_))
        ));
        assert_eq!(iface.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_auto_port_resolved_per_attempt() {
        let mut iface = SerialInterface::new(AUTO_PORT);
        assert!(iface.is_auto_detect());

        let err = iface.resolve_port(|| None).unwrap_err();
        assert!(matches!(err, BridgeError::PortNotFound(_)));
        assert!(err.is_retriable());

        iface.resolve_port(|| Some("/dev/ttyACM0".to_string())).unwrap();
        assert_eq!(iface.port_path(), Path::new("/dev/ttyACM0"));

        // Replugged under a new node
        iface.resolve_port(|| Some("/dev/ttyACM1".to_string())).unwrap();
        assert_eq!(iface.port_path(), Path::new("/dev/ttyACM1"));
        assert!(iface.is_auto_detect());
    }

    #[test]
    fn test_fixed_port_skips_detection() {
        let mut iface = SerialInterface::new("/dev/ttyUSB0");
        iface
            .resolve_port(|| panic!("detection must not run for a fixed port"))
            .unwrap();
        assert_eq!(iface.port_path(), Path::new("/dev/ttyUSB0"));
    }
}
