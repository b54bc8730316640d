//! Enumeration group
//!
//! Asks the device which management groups it supports.

use std::rc::Rc;

use ciborium::value::Value;
use smpmgr_core::cbor;
use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport, TransportError};

use super::{GroupClient, GroupParameters, GROUP_ID_ENUM};
use crate::processor::Processor;

const COMMAND_COUNT: u8 = 0;
const COMMAND_LIST: u8 = 1;
const COMMAND_SINGLE: u8 = 2;
const COMMAND_DETAILS: u8 = 3;

/// Enumeration group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("TOO_MANY_GROUP_ENTRIES", "Too many group entries were provided"),
    ErrorEntry::new(
        "INSUFFICIENT_HEAP_FOR_ENTRIES",
        "Insufficient heap memory to store entry data",
    ),
    ErrorEntry::new("INDEX_TOO_LARGE", "The provided index is larger than the number of groups"),
];

/// One entry of [`EnumGroup::single`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupEntry {
    /// Group ID at the requested index
    pub group: u16,
    /// This is the last group
    pub end: bool,
}

/// Details of one supported group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDetails {
    /// Group ID
    pub group: u16,
    /// Group name, if the device reports it
    pub name: Option<String>,
    /// Number of command handlers, if the device reports it
    pub handlers: Option<u32>,
}

fn group_id(value: &Value) -> Option<u16> {
    cbor::to_i64(value).and_then(|id| u16::try_from(id).ok())
}

/// Enumeration commands
pub struct EnumGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> EnumGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_ENUM, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_ENUM),
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

    /// Number of groups the device supports
    pub async fn count(&self) -> Result<u32> {
        let message = self.client.request(Operation::Read, COMMAND_COUNT);
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::get_u64(c, "count"))
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// IDs of all supported groups
    pub async fn list(&self) -> Result<Vec<u16>> {
        let message = self.client.request(Operation::Read, COMMAND_LIST);
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::map_get(c, "groups"))
            .and_then(Value::as_array)
            .and_then(|ids| ids.iter().map(group_id).collect::<Option<Vec<_>>>())
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// The supported group at `index`
    pub async fn single(&self, index: u32) -> Result<GroupEntry> {
        let mut message = self.client.request(Operation::Read, COMMAND_SINGLE);
        if index != 0 {
            message.push_field("index", index);
        }
        let reply = self.client.send(message).await?;
        let contents = reply.contents().ok_or(TransportError::InvalidResponse)?;

        Ok(GroupEntry {
            group: cbor::map_get(contents, "group")
                .and_then(group_id)
                .ok_or(TransportError::InvalidResponse)?,
            end: cbor::get_flag(contents, "end"),
        })
    }

    /// Name and handler count of every supported group
    pub async fn details(&self) -> Result<Vec<GroupDetails>> {
        let message = self.client.request(Operation::Read, COMMAND_DETAILS);
        let reply = self.client.send(message).await?;
        let groups = reply
            .contents()
            .and_then(|c| cbor::map_get(c, "groups"))
            .and_then(Value::as_array)
            .ok_or(TransportError::InvalidResponse)?;

        groups
            .iter()
            .map(|entry| -> Result<GroupDetails> {
                let group = cbor::map_get(entry, "group")
                    .and_then(group_id)
                    .ok_or(TransportError::InvalidResponse)?;
                Ok(GroupDetails {
                    group,
                    name: cbor::get_text(entry, "name").map(str::to_string),
                    handlers: cbor::get_u64(entry, "handlers").and_then(|n| u32::try_from(n).ok()),
                })
            })
            .collect()
    }
}
