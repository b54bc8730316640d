//! Statistics group

use std::rc::Rc;

use ciborium::value::Value;
use smpmgr_core::cbor;
use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport, TransportError};

use super::{GroupClient, GroupParameters, GROUP_ID_STATS};
use crate::processor::Processor;

const COMMAND_GROUP_DATA: u8 = 0;
const COMMAND_LIST_GROUPS: u8 = 1;

/// Statistics group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("INVALID_GROUP", "The provided statistic group name was not found"),
    ErrorEntry::new("INVALID_STAT_NAME", "The provided statistic name was not found"),
    ErrorEntry::new("INVALID_STAT_SIZE", "The size of the statistic cannot be handled"),
    ErrorEntry::new("WALK_ABORTED", "Walk through of statistics was aborted"),
];

/// Statistics commands
pub struct StatGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> StatGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_STATS, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_STATS),
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

    /// Read every counter of the statistics group `name`, in device order
    pub async fn group_data(&self, name: &str) -> Result<Vec<(String, u64)>> {
        let message = self
            .client
            .request(Operation::Read, COMMAND_GROUP_DATA)
            .with_field("name", name);
        let reply = self.client.send(message).await?;
        let fields = reply
            .contents()
            .and_then(|c| cbor::map_get(c, "fields"))
            .and_then(Value::as_map)
            .ok_or(TransportError::InvalidResponse)?;

        fields
            .iter()
            .map(|(key, value)| -> Result<(String, u64)> {
                let key = key.as_text().ok_or(TransportError::InvalidResponse)?;
                let value = cbor::to_i64(value)
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or(TransportError::InvalidResponse)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// List the statistics groups the device has
    pub async fn list_groups(&self) -> Result<Vec<String>> {
        let message = self.client.request(Operation::Read, COMMAND_LIST_GROUPS);
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::map_get(c, "stat_list"))
            .and_then(Value::as_array)
            .and_then(|names| {
                names
                    .iter()
                    .map(|n| n.as_text().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smpmgr_core::Error;
    use smpmgr_dummy::DummyDevice;

    fn group() -> (StatGroup<DummyDevice>, ErrorRegistry) {
        let processor = Rc::new(Processor::new(DummyDevice::new_default()));
        let mut registry = ErrorRegistry::new();
        let stat = StatGroup::new(processor, &mut registry);
        (stat, registry)
    }

    #[tokio::test]
    async fn test_list_and_read() {
        let (stat, registry) = group();
        assert!(registry.is_registered(GROUP_ID_STATS));

        let groups = stat.list_groups().await.unwrap();
        assert_eq!(groups, ["smp_svr_stats"]);

        // The counter includes the request being answered
        let fields = stat.group_data(&groups[0]).await.unwrap();
        assert_eq!(
            fields,
            vec![("requests".to_string(), 2), ("resets".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let (stat, registry) = group();
        let err = stat.group_data("missing").await.unwrap_err();
        assert_eq!(
            err,
            Error::Group {
                group: GROUP_ID_STATS,
                rc: 2
            }
        );
        assert!(registry.describe(&err).contains("INVALID_GROUP"));
    }
}
