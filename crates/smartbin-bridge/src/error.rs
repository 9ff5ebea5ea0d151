//! Error types for smart-bin bridge operations
//!
//! [`BridgeError`] covers the serial link, the remote database, the delivery
//! queue and configuration. [`ParseError`] describes why a single frame was
//! rejected; it never stops the stream.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Serial/Interface Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial port disconnected
    #[error("Serial port disconnected")]
    Disconnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Frame Errors =====
    /// A frame was rejected by the parser
    #[error("Frame rejected: {0}")]
    Parse(#[from] ParseError),

    // ===== Remote Database Errors =====
    /// Network or auth hiccup; the write may succeed on retry
    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    /// Bad path or schema; the write will never succeed
    #[error("Permanent remote error: {0}")]
    PermanentRemote(String),

    /// A single remote write attempt exceeded its deadline
    #[error("Remote write attempt timed out after {duration_ms}ms")]
    AttemptTimeout {
        /// Attempt deadline in milliseconds
        duration_ms: u64,
    },

    /// Retries were cut short by shutdown
    #[error("Remote write abandoned: {0}")]
    Abandoned(String),

    // ===== Queue Errors =====
    /// Delivery queue no longer accepts readings
    #[error("Delivery queue closed")]
    QueueClosed,

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if the serial link can recover from this error by reconnecting
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionTimeout { .. }
                | BridgeError::Disconnected
                | BridgeError::ReadError(_)
                | BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::Io(_)
        )
    }

    /// Check if a failed remote write should be attempted again
    pub fn is_remote_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientRemote(_) | BridgeError::AttemptTimeout { .. }
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            BridgeError::Parse(e) => e.error_code(),
            BridgeError::TransientRemote(_) => "TRANSIENT_REMOTE",
            BridgeError::PermanentRemote(_) => "PERMANENT_REMOTE",
            BridgeError::AttemptTimeout { .. } => "ATTEMPT_TIMEOUT",
            BridgeError::Abandoned(_) => "ABANDONED",
            BridgeError::QueueClosed => "QUEUE_CLOSED",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Why a frame payload could not become a telemetry reading
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Payload is not a JSON object
    #[error("Malformed payload: {0}")]
    MalformedSyntax(String),

    /// A required field is absent
    #[error("Missing field: {field}")]
    MissingField {
        /// Dotted path of the absent field
        field: String,
    },

    /// `materialDetected` is not a usable material name
    #[error("Invalid value for {field}: {value}")]
    InvalidEnumValue {
        /// Field holding the value
        field: String,
        /// Offending value, rendered as JSON
        value: String,
    },

    /// A field is present with the wrong JSON type
    #[error("Field {field} must be a {expected}")]
    InvalidFieldType {
        /// Dotted path of the field
        field: String,
        /// Expected JSON type
        expected: &'static str,
    },
}

impl ParseError {
    /// Structurally valid JSON that is semantically incomplete
    pub fn is_validation(&self) -> bool {
        !matches!(self, ParseError::MalformedSyntax(_))
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            ParseError::MalformedSyntax(_) => "MALFORMED_SYNTAX",
            ParseError::MissingField { .. } => "MISSING_FIELD",
            ParseError::InvalidEnumValue { .. } => "INVALID_ENUM_VALUE",
            ParseError::InvalidFieldType { .. } => "INVALID_FIELD_TYPE",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::MalformedSyntax(err.to_string())
    }
}

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::PortNotFound("/dev/ttyACM0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");

        let err = BridgeError::from(ParseError::MissingField {
            field: "plastic.status".to_string(),
        });
        assert_eq!(err.error_code(), "MISSING_FIELD");
    }

    #[test]
    fn test_is_retriable() {
        assert!(BridgeError::Disconnected.is_retriable());
        assert!(BridgeError::ConnectionTimeout { duration_ms: 1000 }.is_retriable());
        assert!(!BridgeError::InvalidConfig("baud".to_string()).is_retriable());
    }

    #[test]
    fn test_remote_transient() {
        assert!(BridgeError::TransientRemote("503".to_string()).is_remote_transient());
        assert!(BridgeError::AttemptTimeout { duration_ms: 10 }.is_remote_transient());
        assert!(!BridgeError::PermanentRemote("bad path".to_string()).is_remote_transient());
    }

    #[test]
    fn test_parse_error_classification() {
        assert!(!ParseError::MalformedSyntax("eof".to_string()).is_validation());
        assert!(ParseError::MissingField {
            field: "metal.status".to_string()
        }
        .is_validation());
        assert!(ParseError::InvalidEnumValue {
            field: "materialDetected".to_string(),
            value: "42".to_string(),
        }
        .is_validation());
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let parse: ParseError = err.into();
        assert_eq!(parse.error_code(), "MALFORMED_SYNTAX");
    }
}
