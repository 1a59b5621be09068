//! # Xeus Modbus Error Handling
//!
//! Error types for every layer of the instrument client: the TCP session, the RTU
//! frame codec, device exception replies and partially available measurement data.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket reads and writes failing mid-exchange
//! - **Connection Errors**: connection establishment failures, resets, peer close
//! - **Timeout Errors**: connect timeouts
//! - **Retries Exhausted**: the reconnect policy gave up; the session is `Disconnected`
//!
//! ### Protocol Errors
//! - **Short Response**: fewer bytes than the smallest valid frame (often an empty reply)
//! - **CRC Mismatch**: only raised when the caller asks for strict CRC checking
//! - **Unexpected Function**: reply function code does not match the request
//! - **Truncated**: declared byte count exceeds the bytes received
//!
//! ### Device Errors
//! - **Exception**: Modbus exception codes 1-8 returned by the instrument
//!
//! ### Data Errors
//! - **Partial Data**: optional register ranges were missing after the bounded retry
//!
//! ## Usage Examples
//!
//! ```rust
//! use xeus_modbus::ModbusError;
//!
//! fn classify(error: &ModbusError) {
//!     if error.is_transport_error() {
//!         println!("Network issue: {}", error);
//!     } else if let Some(code) = error.exception_code() {
//!         println!("Device refused the request with code {}", code);
//!     } else {
//!         println!("Other issue: {}", error);
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for every fallible operation in this crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus exception code: register address not available
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
/// Modbus exception code: quantity or value rejected
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Register range that could not be read during a chunked read.
///
/// `offset` is relative to the base address the read plan was executed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MissingRange {
    pub offset: u16,
    pub quantity: u16,
}

impl std::fmt::Display for MissingRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{}..+{}", self.offset, self.offset as u32 + self.quantity as u32)
    }
}

/// Comprehensive error type for the instrument client.
///
/// Each variant carries enough context to decide whether the caller should retry a
/// fresh logical operation, fall back to defaults, or report a hard failure.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Socket-level I/O failure during an exchange
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    ///
    /// # Examples
    /// - Connection refused by the instrument
    /// - Connection reset by peer
    /// - Peer closed the stream before replying
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An operation exceeded its configured timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The transport retry policy was exhausted
    ///
    /// The session is left `Disconnected`; the next call reconnects from scratch.
    #[error("Transport gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Reply is shorter than the smallest valid frame
    #[error("Short response: got {received} bytes, need at least {minimum}")]
    ShortResponse { received: usize, minimum: usize },

    /// CRC validation failure
    ///
    /// The codec reports CRC validity as a flag on every response; this error is only
    /// produced when a caller explicitly demands a valid trailer.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Reply function code does not match the request
    #[error("Unexpected function code: expected {expected:02X}, got {actual:02X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    /// Declared byte count exceeds the bytes actually received
    ///
    /// `salvaged` holds the registers that could still be decoded from the prefix.
    #[error("Truncated response: declared {declared} data bytes, {available} available")]
    Truncated {
        declared: usize,
        available: usize,
        salvaged: Vec<u16>,
    },

    /// Structurally invalid frame
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Optional register ranges could not be read
    #[error("Partial data: {} register range(s) missing", missing.len())]
    PartialData { missing: Vec<MissingRange> },

    /// Address/quantity combination outside protocol limits
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid request argument or undecodable value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Invalid client configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a retries-exhausted error from the last failure seen
    pub fn retries_exhausted(attempts: u32, last_error: &ModbusError) -> Self {
        Self::RetriesExhausted {
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Create a short-response error
    pub fn short_response(received: usize, minimum: usize) -> Self {
        Self::ShortResponse { received, minimum }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an unexpected-function error
    pub fn unexpected_function(expected: u8, actual: u8) -> Self {
        Self::UnexpectedFunction { expected, actual }
    }

    /// Create a truncated-response error carrying the salvageable registers
    pub fn truncated(declared: usize, available: usize, salvaged: Vec<u16>) -> Self {
        Self::Truncated {
            declared,
            available,
            salvaged,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a Modbus exception error
    pub fn exception(function: u8, code: u8) -> Self {
        let message = crate::protocol::ModbusException::from_u8(code)
            .map_or_else(|| "Unknown Exception".to_string(), |e| e.to_string());

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a partial data error
    pub fn partial_data(missing: Vec<MissingRange>) -> Self {
        Self::PartialData { missing }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (a fresh logical operation may succeed)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use xeus_modbus::ModbusError;
    ///
    /// assert!(ModbusError::connection("reset by peer").is_recoverable());
    /// assert!(!ModbusError::exception(0x04, 0x01).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::RetriesExhausted { .. } => true,
            Self::ShortResponse { .. } => true,
            Self::Truncated { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::RetriesExhausted { .. }
        )
    }

    /// Check if the error should trigger a socket reconnect inside the session
    ///
    /// Retries exhaustion is excluded: it is the terminal outcome of the policy.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a framing/protocol issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use xeus_modbus::ModbusError;
    ///
    /// assert!(ModbusError::short_response(0, 5).is_protocol_error());
    /// assert!(!ModbusError::io("broken pipe").is_protocol_error());
    /// ```
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ShortResponse { .. }
                | Self::CrcMismatch { .. }
                | Self::UnexpectedFunction { .. }
                | Self::Truncated { .. }
                | Self::Frame { .. }
        )
    }

    /// Modbus exception code, if this is a device exception
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Exception codes signalling an unavailable register range
    pub fn is_unavailable_range(&self) -> bool {
        matches!(
            self.exception_code(),
            Some(EXCEPTION_ILLEGAL_DATA_ADDRESS) | Some(EXCEPTION_ILLEGAL_DATA_VALUE)
        )
    }
}

/// Convert from std::io::Error
///
/// Resets, aborts, broken pipes and EOFs become `Connection` errors; everything else
/// stays a generic `Io` error. Both trigger the session's reconnect policy.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
