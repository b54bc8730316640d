//! smpmgr-core - Core types for the Simple Management Protocol
//!
//! This crate holds everything about SMP that does not depend on a particular
//! link or runtime:
//!
//! - [`message`] - the 8-byte header and CBOR payload codec
//! - [`crc16`] - the checksum used by serial framing
//! - [`image`] - MCUboot image header and TLV hash extraction
//! - [`registry`] - error code tables
//! - [`transport`] - the trait implemented by each link
//!
//! # Example
//!
//! ```
//! use smpmgr_core::message::{Operation, ProtocolVersion, SmpMessage};
//!
//! let mut message = SmpMessage::start(Operation::Write, ProtocolVersion::V2, 0, 0)
//!     .with_field("d", "hello");
//! message.finalize().unwrap();
//! assert!(message.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
// Transports are used through generics only, never as trait objects
#![allow(async_fn_in_trait)]

pub mod cbor;
pub mod crc16;
pub mod error;
pub mod image;
pub mod message;
pub mod registry;
pub mod transport;

pub use error::{Error, ImageError, Result, TransportError};
pub use message::{Operation, ProtocolVersion, SmpMessage};
pub use registry::ErrorRegistry;
pub use transport::Transport;
