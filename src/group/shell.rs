//! Shell management group

use std::rc::Rc;

use ciborium::value::Value;
use smpmgr_core::cbor;
use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport, TransportError};

use super::{GroupClient, GroupParameters, GROUP_ID_SHELL};
use crate::processor::Processor;

const COMMAND_EXECUTE: u8 = 0;

/// Shell group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("COMMAND_TOO_LONG", "The provided command to execute is too long"),
    ErrorEntry::new("EMPTY_COMMAND", "No command to execute was provided"),
];

/// Result of a shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Text the command printed
    pub output: String,
    /// Return code of the command; 0 on success
    pub ret: i32,
}

/// Shell commands
pub struct ShellGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> ShellGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_SHELL, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_SHELL),
        }
    }

    /// Request parameters
    pub fn parameters(&self) -> &GroupParameters {
        self.client.params()
    }

    /// Change request parameters
    pub fn set_parameters(&mut self, params: GroupParameters) {
        self.client.set_params(params);
    }

    /// Run a shell command on the device
    ///
    /// A command that runs but fails is not an error: check
    /// [`ShellOutput::ret`].
    pub async fn execute(&self, argv: &[&str]) -> Result<ShellOutput> {
        let args = argv.iter().map(|&arg| Value::from(arg)).collect();
        let message = self
            .client
            .request(Operation::Write, COMMAND_EXECUTE)
            .with_field("argv", Value::Array(args));
        let reply = self.client.send(message).await?;
        let contents = reply.contents().ok_or(TransportError::InvalidResponse)?;

        let output = cbor::get_text(contents, "o").ok_or(TransportError::InvalidResponse)?;
        let ret = cbor::get_i64(contents, "ret")
            .and_then(|r| i32::try_from(r).ok())
            .ok_or(TransportError::InvalidResponse)?;

        if ret != 0 {
            log::debug!("shell: {:?} returned {}", argv, ret);
        }
        Ok(ShellOutput {
            output: output.to_string(),
            ret,
        })
    }
}
