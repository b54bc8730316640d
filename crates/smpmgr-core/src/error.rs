//! Error types for SMP operations
//!
//! Errors are split by layer: [`TransportError`] for anything between the
//! host and the device link, [`ImageError`] for firmware image parsing, and
//! the umbrella [`Error`] which also carries the error codes a device can
//! return inside an otherwise well-formed response.

use thiserror::Error;

/// Transport-level errors
///
/// These are fatal to the individual call; callers decide whether to retry
/// the whole operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport is not connected
    #[error("Not connected")]
    NotConnected,

    /// The transport is already connected
    #[error("Already connected")]
    AlreadyConnected,

    /// Another request is already in flight
    #[error("Processor busy")]
    Busy,

    /// Transport configuration is missing or invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The underlying device could not be opened
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// The message does not fit the transport or the negotiated MTU
    #[error("Message too large")]
    MessageTooLarge,

    /// No matching response arrived in time
    #[error("Timeout waiting for response")]
    Timeout,

    /// The message to send is incomplete or inconsistent
    #[error("Message not valid")]
    MessageNotValid,

    /// The device response could not be decoded or lacks required fields
    #[error("Response not valid")]
    InvalidResponse,

    /// I/O error on the underlying link
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Firmware image parsing errors
///
/// These are raised before any bytes of an upload are transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// Image is shorter than the structure being read
    #[error("Image too short: need {needed} bytes, have {actual}")]
    TooShort {
        /// Bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header magic is not a known MCUboot magic
    #[error("Invalid image header magic: {0:02X?}")]
    InvalidMagic([u8; 4]),

    /// Image size field fails the sanity bound
    #[error("Image size {0} is out of range")]
    ImageSizeOutOfRange(u32),

    /// No TLV info area was found after the image body
    #[error("TLV area not found")]
    TlvAreaNotFound,

    /// A TLV entry runs past the end of the image
    #[error("TLV entry at offset 0x{0:X} is truncated")]
    TruncatedTlv(usize),

    /// More than one hash TLV is present
    #[error("Multiple hash TLVs found")]
    DuplicateHash,

    /// No usable hash TLV is present
    #[error("Hash TLV not found")]
    HashNotFound,
}

/// Umbrella error returned by processor and command group operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// SMP version 1 error: a bare `rc` in the response
    #[error("SMP version 1 error, rc: {rc}")]
    Rc {
        /// Result code
        rc: i32,
    },

    /// SMP version 2 error: an `err` map with `group` and `rc`
    #[error("SMP version 2 error, group: {group}, rc: {rc}")]
    Group {
        /// Group that reported the error
        group: u16,
        /// Group-specific result code
        rc: i32,
    },

    /// Firmware image could not be parsed
    #[error(transparent)]
    Image(#[from] ImageError),
}

impl Error {
    /// Whether this is a timeout reported by the transport
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Timeout))
    }
}

/// Result type for SMP operations
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Group { group: 1, rc: 3 }.to_string(),
            "SMP version 2 error, group: 1, rc: 3"
        );
        assert_eq!(Error::Rc { rc: 8 }.to_string(), "SMP version 1 error, rc: 8");
        assert_eq!(
            Error::from(TransportError::Busy).to_string(),
            "Processor busy"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(TransportError::from(io), TransportError::Io(_)));
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::from(TransportError::Timeout).is_timeout());
        assert!(!Error::Rc { rc: 4 }.is_timeout());
    }
}
