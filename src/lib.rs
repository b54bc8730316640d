//! smpmgr - Simple Management Protocol client
//!
//! Management of Zephyr/MCUboot devices over SMP: a [`Processor`] runs one
//! request at a time over any [`Transport`] with retries and version 1
//! fallback, and the command groups in [`group`] turn requests and replies
//! into typed calls.
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//!
//! use smpmgr::group::{img::ImgGroup, os::OsGroup};
//! use smpmgr::{ErrorRegistry, Processor};
//!
//! let transport = smpmgr::open_uart("dev=/dev/ttyACM0")?;
//! let processor = Rc::new(Processor::new(transport));
//! let mut registry = ErrorRegistry::new();
//!
//! let os = OsGroup::new(Rc::clone(&processor), &mut registry);
//! let img = ImgGroup::new(Rc::clone(&processor), &mut registry);
//!
//! println!("{}", os.echo("hello").await?);
//! for image in img.state().await? {
//!     println!("slot {}: {}", image.slot, image.version);
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod group;
pub mod processor;

pub use processor::{Processor, ProcessorState};
pub use smpmgr_core::{Error, ErrorRegistry, ImageError, Result, Transport, TransportError};
pub use smpmgr_uart::{open_uart, UartConfig, UartTransport};
