//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to an instrument
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No terminating line arrived in time
    #[error("No reply matching the terminator of '{command}' within {timeout_ms}ms")]
    Timeout {
        /// Command that went unanswered (hex bytes for raw exchanges)
        command: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The caller's cancellation token fired
    #[error("Request cancelled")]
    Cancelled,

    /// Reading or writing the line failed; the connection is unusable
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The connection was closed or had already failed
    #[error("Connection closed")]
    ConnectionClosed,

    /// A binary reply did not validate
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// A terminator or event pattern did not compile
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// The serial driver rejected an operation
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No device exists at the given path
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// The configuration values are unusable
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A shared operation panicked instead of returning
    #[error("Operation panicked: {0}")]
    OperationPanicked(String),
}

impl ProtocolError {
    /// Whether this error makes the owning connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::TransportFailure(_) | ProtocolError::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::TransportFailure(err.to_string())
    }
}

impl From<regex::Error> for ProtocolError {
    fn from(err: regex::Error) -> Self {
        ProtocolError::InvalidPattern(err.to_string())
    }
}

/// Errors raised while validating a binary frame
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// First byte was not the start marker
    #[error("Unexpected start byte {0:#04x}")]
    UnexpectedStart(u8),

    /// Byte after the checksum was not the end marker
    #[error("Unexpected end byte {0:#04x}")]
    UnexpectedEnd(u8),

    /// Checksum byte did not match the frame contents
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        expected: u8,
        /// Checksum byte on the wire
        actual: u8,
    },

    /// The frame carried more bytes than its length byte declared
    #[error("Length mismatch: header says {declared} bytes, got {actual}")]
    LengthMismatch {
        /// Payload length from the header
        declared: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// The stream went quiet in the middle of a frame
    #[error("Stream ended after {received} bytes of an incomplete frame")]
    PrematureEnd {
        /// Bytes of the frame seen so far
        received: usize,
    },

    /// Payload longer than a length byte can describe
    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(ProtocolError::TransportFailure("eof".to_string()).is_fatal());
        assert!(ProtocolError::ConnectionClosed.is_fatal());
        assert!(!ProtocolError::Cancelled.is_fatal());
        assert!(!ProtocolError::Framing(FramingError::UnexpectedEnd(0)).is_fatal());
    }

    #[test]
    fn test_conversions() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(ProtocolError::from(io), ProtocolError::TransportFailure(_)));

        let framing: ProtocolError = FramingError::PayloadTooLarge(300).into();
        assert_eq!(framing.to_string(), "Framing error: Payload of 300 bytes does not fit in a frame");
    }
}
