//! SMP command groups
//!
//! Each group builds requests for its commands, sends them through a shared
//! [`Processor`] and maps the named fields of the reply into typed results.

pub mod enumeration;
pub mod img;
pub mod os;
pub mod settings;
pub mod shell;
pub mod stat;
pub mod zephyr;

use std::rc::Rc;

use smpmgr_core::message::{Operation, SmpMessage};
use smpmgr_core::transport::{DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS};
use smpmgr_core::{ProtocolVersion, Result, Transport, TransportError};

use crate::processor::Processor;

/// OS management group
pub const GROUP_ID_OS: u16 = 0;
/// Image management group
pub const GROUP_ID_IMG: u16 = 1;
/// Statistics group
pub const GROUP_ID_STATS: u16 = 2;
/// Settings (config) group
pub const GROUP_ID_SETTINGS: u16 = 3;
/// Shell group
pub const GROUP_ID_SHELL: u16 = 9;
/// Enumeration group
pub const GROUP_ID_ENUM: u16 = 10;
/// Zephyr basic group
pub const GROUP_ID_ZEPHYR: u16 = 63;

/// Default link MTU
pub const DEFAULT_MTU: usize = 256;

/// Per-group request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupParameters {
    /// Header version of outgoing requests
    pub version: ProtocolVersion,
    /// Link MTU used to bound request size
    pub mtu: usize,
    /// Retries after a timeout
    pub retries: u8,
    /// Response timeout in milliseconds
    pub timeout_ms: u32,
}

impl Default for GroupParameters {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V2,
            mtu: DEFAULT_MTU,
            retries: DEFAULT_RETRIES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl GroupParameters {
    /// Parameters using the retry and timeout defaults of a transport
    pub fn from_transport<T: Transport>(transport: &T) -> Self {
        Self {
            retries: transport.retries(),
            timeout_ms: transport.timeout_ms(),
            ..Self::default()
        }
    }
}

/// State shared by all groups: the processor, the group ID and parameters
pub(crate) struct GroupClient<T: Transport> {
    processor: Rc<Processor<T>>,
    group: u16,
    params: GroupParameters,
}

impl<T: Transport> GroupClient<T> {
    pub(crate) fn new(processor: Rc<Processor<T>>, group: u16) -> Self {
        Self {
            processor,
            group,
            params: GroupParameters::default(),
        }
    }

    pub(crate) fn params(&self) -> &GroupParameters {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: GroupParameters) {
        self.params = params;
    }

    /// Start a request for `command` in this group
    pub(crate) fn request(&self, op: Operation, command: u8) -> SmpMessage {
        SmpMessage::start(op, self.params.version, self.group, command)
    }

    /// Largest request the processor's transport accepts at the group MTU
    pub(crate) fn max_message_size(&self) -> core::result::Result<usize, TransportError> {
        self.processor.max_message_data_size(self.params.mtu)
    }

    /// Finalize, size-check and send a request
    pub(crate) async fn send(&self, mut message: SmpMessage) -> Result<SmpMessage> {
        message.finalize()?;

        if message.size() > self.max_message_size()? {
            return Err(TransportError::MessageTooLarge.into());
        }

        self.processor
            .send(message, self.params.timeout_ms, self.params.retries, true)
            .await
    }
}
