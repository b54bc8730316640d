//! smpmgr-uart - SMP over a serial console
//!
//! This crate implements the SMP console transport used by Zephyr's MCUmgr
//! shell and UART transports: messages are CRC-protected, base64-encoded and
//! split into marker-prefixed lines, so they can share a port with regular
//! console output.
//!
//! # Example
//!
//! ```ignore
//! use smpmgr_core::Transport;
//! use smpmgr_uart::open_uart;
//!
//! let mut transport = open_uart("dev=/dev/ttyACM0:115200")?;
//! assert!(transport.is_connected());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod framing;
pub mod transport;

pub use config::{UartConfig, DEFAULT_BAUD};
pub use transport::UartTransport;

use smpmgr_core::{Transport, TransportError};

/// Parse a connection string and open the port
///
/// See [`UartConfig::parse`] for the accepted formats.
pub fn open_uart(options: &str) -> Result<UartTransport, TransportError> {
    let config = UartConfig::parse(options)?;
    let mut transport = UartTransport::with_config(config);
    transport.connect()?;
    Ok(transport)
}
