//! Zephyr basic management group

use std::rc::Rc;

use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport};

use super::{GroupClient, GroupParameters, GROUP_ID_ZEPHYR};
use crate::processor::Processor;

const COMMAND_STORAGE_ERASE: u8 = 0;

/// Zephyr basic group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("FLASH_OPEN_FAILED", "Opening of the flash area has failed"),
    ErrorEntry::new(
        "FLASH_CONFIG_QUERY_FAIL",
        "Querying the flash area parameters has failed",
    ),
    ErrorEntry::new("FLASH_ERASE_FAILED", "Erasing the flash area has failed"),
];

/// Zephyr basic commands
pub struct ZephyrGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> ZephyrGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_ZEPHYR, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_ZEPHYR),
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

    /// Erase the storage partition, wiping persisted settings
    pub async fn storage_erase(&self) -> Result<()> {
        let message = self.client.request(Operation::Write, COMMAND_STORAGE_ERASE);
        self.client.send(message).await?;
        log::info!("Storage partition erased");
        Ok(())
    }
}
