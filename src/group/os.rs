//! OS management group

use std::rc::Rc;

use chrono::{DateTime, NaiveDateTime};
use ciborium::value::Value;
use smpmgr_core::cbor;
use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport, TransportError};

use super::{GroupClient, GroupParameters, GROUP_ID_OS};
use crate::processor::Processor;

const COMMAND_ECHO: u8 = 0;
const COMMAND_TASK_STATS: u8 = 2;
const COMMAND_MEMORY_POOL: u8 = 3;
const COMMAND_DATE_TIME: u8 = 4;
const COMMAND_RESET: u8 = 5;
const COMMAND_MCUMGR_PARAMETERS: u8 = 6;
const COMMAND_APPLICATION_INFO: u8 = 7;
const COMMAND_BOOTLOADER_INFO: u8 = 8;

/// Date-time layout sent to the device
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Layout of device replies without a timezone, fractional seconds optional
const DATE_TIME_REPLY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Bootloader query answered by every device
pub const BOOTLOADER_QUERY_NAME: &str = "bootloader";

/// OS group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("INVALID_FORMAT", "The provided format value is not valid"),
    ErrorEntry::new("QUERY_YIELDS_NO_ANSWER", "Query was not recognized"),
];

/// SMP buffer parameters of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McumgrParameters {
    /// Size of each SMP buffer in bytes
    pub buf_size: u32,
    /// Number of SMP buffers
    pub buf_count: u32,
}

/// One thread as reported by the task statistics command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    /// Thread name
    pub name: String,
    /// Priority
    pub priority: i64,
    /// Thread ID
    pub id: u64,
    /// Scheduler state flags
    pub state: u64,
    /// Stack bytes used
    pub stack_used: u64,
    /// Stack size in bytes
    pub stack_size: u64,
    /// Context switches
    pub context_switches: u64,
    /// Cycles spent running
    pub runtime: u64,
}

/// One memory pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPool {
    /// Pool name
    pub name: String,
    /// Block size in bytes
    pub block_size: u64,
    /// Number of blocks
    pub blocks: u64,
    /// Blocks currently free
    pub free: u64,
    /// Lowest number of free blocks seen
    pub min_free: u64,
}

fn u64_field(value: &Value, key: &str) -> u64 {
    cbor::get_u64(value, key).unwrap_or(0)
}

/// Parse a device date-time, with or without a timezone
fn parse_date_time(text: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(text, DATE_TIME_REPLY_FORMAT))
        .ok()
}

/// OS management commands
pub struct OsGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> OsGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_OS, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_OS),
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

    /// Send `text` to the device and return its echo
    pub async fn echo(&self, text: &str) -> Result<String> {
        let message = self
            .client
            .request(Operation::Write, COMMAND_ECHO)
            .with_field("d", text);
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::get_text(c, "r"))
            .map(str::to_string)
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// Read scheduler statistics for every thread
    pub async fn task_stats(&self) -> Result<Vec<TaskStats>> {
        let message = self.client.request(Operation::Read, COMMAND_TASK_STATS);
        let reply = self.client.send(message).await?;
        let tasks = reply
            .contents()
            .and_then(|c| cbor::map_get(c, "tasks"))
            .and_then(Value::as_map)
            .ok_or(TransportError::InvalidResponse)?;

        tasks
            .iter()
            .map(|(name, stats)| -> Result<TaskStats> {
                let name = name.as_text().ok_or(TransportError::InvalidResponse)?;
                Ok(TaskStats {
                    name: name.to_string(),
                    priority: cbor::get_i64(stats, "prio").unwrap_or(0),
                    id: u64_field(stats, "tid"),
                    state: u64_field(stats, "state"),
                    stack_used: u64_field(stats, "stkuse"),
                    stack_size: u64_field(stats, "stksiz"),
                    context_switches: u64_field(stats, "cswcnt"),
                    runtime: u64_field(stats, "runtime"),
                })
            })
            .collect()
    }

    /// Read memory pool usage
    pub async fn memory_pool(&self) -> Result<Vec<MemoryPool>> {
        let message = self.client.request(Operation::Read, COMMAND_MEMORY_POOL);
        let reply = self.client.send(message).await?;
        let pools = reply
            .contents()
            .and_then(Value::as_map)
            .filter(|pools| !pools.is_empty())
            .ok_or(TransportError::InvalidResponse)?;

        pools
            .iter()
            .map(|(name, pool)| -> Result<MemoryPool> {
                let name = name.as_text().ok_or(TransportError::InvalidResponse)?;
                Ok(MemoryPool {
                    name: name.to_string(),
                    block_size: u64_field(pool, "blksiz"),
                    blocks: u64_field(pool, "nblks"),
                    free: u64_field(pool, "nfree"),
                    min_free: u64_field(pool, "min"),
                })
            })
            .collect()
    }

    /// Read the device clock
    pub async fn date_time(&self) -> Result<NaiveDateTime> {
        let message = self.client.request(Operation::Read, COMMAND_DATE_TIME);
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::get_text(c, "datetime"))
            .and_then(parse_date_time)
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// Set the device clock
    pub async fn set_date_time(&self, date_time: &NaiveDateTime) -> Result<()> {
        let text = date_time.format(DATE_TIME_FORMAT).to_string();
        let message = self
            .client
            .request(Operation::Write, COMMAND_DATE_TIME)
            .with_field("datetime", text.as_str());
        self.client.send(message).await?;
        log::debug!("os: device clock set to {}", text);
        Ok(())
    }

    /// Read application and system information
    ///
    /// `format` holds `uname`-style letters (`s`, `n`, `r`, `v`, `b`, `m`,
    /// `p`, `i`, `o`, or `a` for all); empty leaves the choice to the device.
    pub async fn application_info(&self, format: &str) -> Result<String> {
        let mut message = self
            .client
            .request(Operation::Read, COMMAND_APPLICATION_INFO);
        if !format.is_empty() {
            message.push_field("format", format);
        }
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .and_then(|c| cbor::get_text(c, "output"))
            .map(str::to_string)
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// Query the bootloader
    ///
    /// Returns the reply map as sent; its keys depend on the query, e.g.
    /// `bootloader` for [`BOOTLOADER_QUERY_NAME`] or `mode` for `"mode"`.
    pub async fn bootloader_info(&self, query: &str) -> Result<Value> {
        let message = self
            .client
            .request(Operation::Read, COMMAND_BOOTLOADER_INFO)
            .with_field("query", query);
        let reply = self.client.send(message).await?;

        reply
            .contents()
            .filter(|c| c.as_map().is_some_and(|m| !m.is_empty()))
            .cloned()
            .ok_or_else(|| TransportError::InvalidResponse.into())
    }

    /// Reset the device
    ///
    /// With `force` set the device resets even if an application hook
    /// would refuse.
    pub async fn reset(&self, force: bool) -> Result<()> {
        let mut message = self.client.request(Operation::Write, COMMAND_RESET);
        if force {
            message.push_field("force", true);
        }
        self.client.send(message).await?;
        log::info!("Device reset requested");
        Ok(())
    }

    /// Read the SMP buffer parameters of the device
    pub async fn mcumgr_parameters(&self) -> Result<McumgrParameters> {
        let message = self
            .client
            .request(Operation::Read, COMMAND_MCUMGR_PARAMETERS);
        let reply = self.client.send(message).await?;
        let contents = reply.contents().ok_or(TransportError::InvalidResponse)?;

        let field = |key: &str| {
            cbor::get_u64(contents, key)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(TransportError::InvalidResponse)
        };

        Ok(McumgrParameters {
            buf_size: field("buf_size")?,
            buf_count: field("buf_count")?,
        })
    }
}
