//! Settings (config) group
//!
//! Values are raw bytes; how they are encoded is up to the subsystem that
//! owns the key. Writes change the running values only until
//! [`SettingsGroup::save`] persists them.

use std::rc::Rc;

use ciborium::value::Value;
use smpmgr_core::cbor;
use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport, TransportError};

use super::{GroupClient, GroupParameters, GROUP_ID_SETTINGS};
use crate::processor::Processor;

const COMMAND_READ_WRITE: u8 = 0;
const COMMAND_DELETE: u8 = 1;
const COMMAND_COMMIT: u8 = 2;
const COMMAND_LOAD_SAVE: u8 = 3;

/// Settings group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("KEY_TOO_LONG", "The provided key name is too long to be used"),
    ErrorEntry::new("KEY_NOT_FOUND", "The provided key name does not exist"),
    ErrorEntry::new("READ_NOT_SUPPORTED", "The provided key name does not support being read"),
    ErrorEntry::new("ROOT_KEY_NOT_FOUND", "The provided root key name does not exist"),
    ErrorEntry::new(
        "WRITE_NOT_SUPPORTED",
        "The provided key name does not support being written",
    ),
    ErrorEntry::new(
        "DELETE_NOT_SUPPORTED",
        "The provided key name does not support being deleted",
    ),
];

/// Settings commands
pub struct SettingsGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> SettingsGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_SETTINGS, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_SETTINGS),
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

    /// Read a setting
    ///
    /// With `max_size` the device returns at most that many bytes.
    pub async fn read(&self, name: &str, max_size: Option<u32>) -> Result<Vec<u8>> {
        let mut message = self
            .client
            .request(Operation::Read, COMMAND_READ_WRITE)
            .with_field("name", name);
        if let Some(max_size) = max_size {
            message.push_field("max_size", max_size);
        }
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::get_bytes(c, "val"))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// Write a setting
    pub async fn write(&self, name: &str, value: &[u8]) -> Result<()> {
        let message = self
            .client
            .request(Operation::Write, COMMAND_READ_WRITE)
            .with_field("name", name)
            .with_field("val", Value::Bytes(value.to_vec()));
        self.client.send(message).await?;
        Ok(())
    }

    /// Delete a setting
    pub async fn delete(&self, name: &str) -> Result<()> {
        let message = self
            .client
            .request(Operation::Write, COMMAND_DELETE)
            .with_field("name", name);
        self.client.send(message).await?;
        Ok(())
    }

    /// Apply written settings to the running application
    pub async fn commit(&self) -> Result<()> {
        let message = self.client.request(Operation::Write, COMMAND_COMMIT);
        self.client.send(message).await?;
        Ok(())
    }

    /// Reload settings from persistent storage
    pub async fn load(&self) -> Result<()> {
        let message = self.client.request(Operation::Read, COMMAND_LOAD_SAVE);
        self.client.send(message).await?;
        Ok(())
    }

    /// Persist the current settings
    pub async fn save(&self) -> Result<()> {
        let message = self.client.request(Operation::Write, COMMAND_LOAD_SAVE);
        self.client.send(message).await?;
        log::debug!("settings: saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smpmgr_core::Error;
    use smpmgr_dummy::DummyDevice;

    fn group() -> (
        Rc<Processor<DummyDevice>>,
        SettingsGroup<DummyDevice>,
        ErrorRegistry,
    ) {
        let processor = Rc::new(Processor::new(DummyDevice::new_default()));
        let mut registry = ErrorRegistry::new();
        let settings = SettingsGroup::new(Rc::clone(&processor), &mut registry);
        (processor, settings, registry)
    }

    #[tokio::test]
    async fn test_read_write() {
        let (processor, settings, _) = group();
        assert_eq!(settings.read("app/name", None).await.unwrap(), b"dummy");
        assert_eq!(settings.read("app/name", Some(3)).await.unwrap(), b"dum");

        settings.write("app/level", &[7, 0]).await.unwrap();
        settings.commit().await.unwrap();
        assert_eq!(settings.read("app/level", None).await.unwrap(), [7, 0]);

        let (stored, commits) = processor
            .with_transport(|d| (d.setting("app/level").map(<[u8]>::to_vec), d.settings_commits()))
            .unwrap();
        assert_eq!(stored, Some(vec![7, 0]));
        assert_eq!(commits, 1);
    }

    #[tokio::test]
    async fn test_delete_missing_key() {
        let (_, settings, registry) = group();
        settings.delete("app/name").await.unwrap();

        let err = settings.read("app/name", None).await.unwrap_err();
        assert_eq!(
            err,
            Error::Group {
                group: GROUP_ID_SETTINGS,
                rc: 3
            }
        );
        assert!(registry.describe(&err).contains("KEY_NOT_FOUND"));
        assert!(settings.delete("app/name").await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (processor, settings, _) = group();
        settings.write("app/name", b"saved").await.unwrap();
        settings.save().await.unwrap();
        settings.write("app/name", b"unsaved").await.unwrap();

        settings.load().await.unwrap();
        assert_eq!(settings.read("app/name", None).await.unwrap(), b"saved");

        let ops: Vec<Operation> = processor
            .with_transport(|d| {
                d.requests()
                    .iter()
                    .filter(|r| r.command() == COMMAND_LOAD_SAVE)
                    .map(|r| r.op())
                    .collect()
            })
            .unwrap();
        assert_eq!(ops, [Operation::Write, Operation::Read]);
    }
}
