//! Transport abstraction
//!
//! A transport moves complete SMP messages between the host and a device.
//! Framing, checksums and reassembly are the transport's business; the
//! processor only sees whole messages.

use crate::error::TransportError;
use crate::message::SmpMessage;

/// Default number of retries after a timeout
pub const DEFAULT_RETRIES: u8 = 3;

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 3000;

/// Link carrying SMP messages to a device
pub trait Transport {
    /// Open the link
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link
    ///
    /// With `force` set the link is torn down even if it reports errors.
    fn disconnect(&mut self, force: bool) -> Result<(), TransportError>;

    /// Whether the link is open
    fn is_connected(&self) -> bool;

    /// Transmit one complete message
    fn send(&mut self, message: &SmpMessage) -> Result<(), TransportError>;

    /// Wait for the next complete message
    ///
    /// Returns [`TransportError::Timeout`] if nothing arrives within
    /// `timeout_ms` milliseconds.
    async fn receive(&mut self, timeout_ms: u32) -> Result<SmpMessage, TransportError>;

    /// Largest SMP message (header plus payload) that fits a link MTU
    fn max_message_data_size(&self, mtu: usize) -> usize {
        mtu
    }

    /// Default number of retries for this medium
    fn retries(&self) -> u8 {
        DEFAULT_RETRIES
    }

    /// Default response timeout for this medium, in milliseconds
    fn timeout_ms(&self) -> u32 {
        DEFAULT_TIMEOUT_MS
    }
}
