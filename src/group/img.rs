//! Image management group
//!
//! Lists and changes the state of the image slots, erases the secondary slot
//! and uploads MCUboot images. An upload is validated locally first: the
//! header magic and the hash TLV must parse before anything is sent.

use std::rc::Rc;
use std::time::Duration;

use ciborium::value::Value;
use sha2::{Digest, Sha256};
use smpmgr_core::cbor;
use smpmgr_core::image::{self, ImageHash};
use smpmgr_core::message::Operation;
use smpmgr_core::registry::{ErrorEntry, ErrorRegistry};
use smpmgr_core::{Result, Transport, TransportError};
use tokio::time::Instant;

use super::{GroupClient, GroupParameters, GROUP_ID_IMG};
use crate::processor::Processor;

const COMMAND_STATE: u8 = 0;
const COMMAND_UPLOAD: u8 = 1;
const COMMAND_ERASE: u8 = 5;
const COMMAND_SLOT_INFO: u8 = 6;

/// Slot erased when none is given
const DEFAULT_ERASE_SLOT: u32 = 1;

/// Encoded size of the `data` key plus the largest byte string header used
/// for a chunk
const DATA_FIELD_OVERHEAD: usize = 8;

/// Lower offsets in a row before the upload is reported as looping
const REPEATED_OFFSET_LIMIT: usize = 3;

/// Image group error codes, starting at rc 2
pub const ERRORS: &[ErrorEntry] = &[
    ErrorEntry::new("FLASH_CONFIG_QUERY_FAIL", "Failed to query flash area configuration"),
    ErrorEntry::new("NO_IMAGE", "There is no image in the slot"),
    ErrorEntry::new("NO_TLVS", "The image in the slot has no TLVs (tag, length, value)"),
    ErrorEntry::new("INVALID_TLV", "The image in the slot has an invalid TLV type and/or length"),
    ErrorEntry::new("TLV_MULTIPLE_HASHES_FOUND", "The image in the slot has multiple hash TLVs"),
    ErrorEntry::new("TLV_INVALID_SIZE", "The image in the slot has an invalid TLV size"),
    ErrorEntry::new("HASH_NOT_FOUND", "The image in the slot does not have a hash TLV"),
    ErrorEntry::new("NO_FREE_SLOT", "There is no free slot to place the image"),
    ErrorEntry::new("FLASH_OPEN_FAILED", "Flash area opening failed"),
    ErrorEntry::new("FLASH_READ_FAILED", "Flash area reading failed"),
    ErrorEntry::new("FLASH_WRITE_FAILED", "Flash area writing failed"),
    ErrorEntry::new("FLASH_ERASE_FAILED", "Flash area erase failed"),
    ErrorEntry::new("INVALID_SLOT", "The provided slot is not valid"),
    ErrorEntry::new("NO_FREE_MEMORY", "Insufficient heap memory"),
    ErrorEntry::new("FLASH_CONTEXT_ALREADY_SET", "The flash context is already set"),
    ErrorEntry::new("FLASH_CONTEXT_NOT_SET", "The flash context is not set"),
    ErrorEntry::new("FLASH_AREA_DEVICE_NULL", "The device for the flash area is NULL"),
    ErrorEntry::new("INVALID_PAGE_OFFSET", "The offset for a page number is invalid"),
    ErrorEntry::new("INVALID_OFFSET", "The offset parameter was not provided"),
    ErrorEntry::new("INVALID_LENGTH", "The length parameter was not provided"),
    ErrorEntry::new(
        "INVALID_IMAGE_HEADER",
        "The image length is smaller than the size of an image header",
    ),
    ErrorEntry::new(
        "INVALID_IMAGE_HEADER_MAGIC",
        "The image header magic value does not match the expected value",
    ),
    ErrorEntry::new("INVALID_HASH", "The hash parameter provided is not valid"),
    ErrorEntry::new(
        "INVALID_FLASH_ADDRESS",
        "The image load address does not match the address of the flash area",
    ),
    ErrorEntry::new("VERSION_GET_FAILED", "Failed to get version of running application"),
    ErrorEntry::new(
        "CURRENT_VERSION_IS_NEWER",
        "The running application is newer than the version being uploaded",
    ),
    ErrorEntry::new("IMAGE_ALREADY_PENDING", "There is already an image operation pending"),
    ErrorEntry::new("INVALID_IMAGE_VECTOR_TABLE", "The image vector table is invalid"),
    ErrorEntry::new("INVALID_IMAGE_TOO_LARGE", "The image is too large to fit"),
    ErrorEntry::new(
        "INVALID_IMAGE_DATA_OVERRUN",
        "The amount of data sent is larger than the provided image size",
    ),
    ErrorEntry::new("IMAGE_CONFIRMATION_DENIED", "Confirmation of image has been denied"),
    ErrorEntry::new(
        "IMAGE_SETTING_TEST_TO_ACTIVE_DENIED",
        "Setting test to active slot is not allowed",
    ),
];

/// State of one image slot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageState {
    /// Image number
    pub image: u32,
    /// Slot number within the image
    pub slot: u32,
    /// Version string
    pub version: String,
    /// Image hash
    pub hash: Vec<u8>,
    /// Image can be booted
    pub bootable: bool,
    /// Image will be test-booted on the next reset
    pub pending: bool,
    /// Image is confirmed
    pub confirmed: bool,
    /// Image is running
    pub active: bool,
    /// Pending image stays after the next reset
    pub permanent: bool,
}

impl ImageState {
    fn from_value(value: &Value) -> Option<Self> {
        if !matches!(value, Value::Map(_)) {
            return None;
        }

        Some(Self {
            image: cbor::get_u64(value, "image")
                .map_or(Some(0), |v| u32::try_from(v).ok())?,
            slot: u32::try_from(cbor::get_u64(value, "slot")?).ok()?,
            version: cbor::get_text(value, "version").unwrap_or_default().to_string(),
            hash: cbor::get_bytes(value, "hash").unwrap_or_default().to_vec(),
            bootable: cbor::get_flag(value, "bootable"),
            pending: cbor::get_flag(value, "pending"),
            confirmed: cbor::get_flag(value, "confirmed"),
            active: cbor::get_flag(value, "active"),
            permanent: cbor::get_flag(value, "permanent"),
        })
    }
}

/// One slot of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Slot number within the image
    pub slot: u32,
    /// Slot size in bytes
    pub size: u64,
    /// Image number to pass to [`ImgGroup::upload`] to write this slot
    pub upload_image_id: Option<u32>,
}

/// Slot layout of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSlots {
    /// Image number
    pub image: u32,
    /// Slots of the image
    pub slots: Vec<SlotInfo>,
    /// Largest image the slots can hold, if the device reports it
    pub max_image_size: Option<u64>,
}

impl ImageSlots {
    fn from_value(value: &Value) -> Option<Self> {
        let slots = cbor::map_get(value, "slots")?
            .as_array()?
            .iter()
            .map(|slot| {
                Some(SlotInfo {
                    slot: u32::try_from(cbor::get_u64(slot, "slot")?).ok()?,
                    size: cbor::get_u64(slot, "size")?,
                    upload_image_id: cbor::get_u64(slot, "upload_image_id")
                        .and_then(|id| u32::try_from(id).ok()),
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            image: u32::try_from(cbor::get_u64(value, "image")?).ok()?,
            slots,
            max_image_size: cbor::get_u64(value, "max_image_size"),
        })
    }
}

/// Progress callback for [`ImgGroup::upload`]
pub trait UploadProgress {
    /// Called once before the first chunk
    fn started(&mut self, total_bytes: usize);

    /// Called after each acknowledged chunk with the device's offset
    fn progress(&mut self, bytes_sent: usize);

    /// Called when the device has acknowledged the whole image
    fn complete(&mut self, report: &UploadReport);
}

/// A no-op progress reporter
pub struct NoProgress;

impl UploadProgress for NoProgress {
    fn started(&mut self, _total_bytes: usize) {}
    fn progress(&mut self, _bytes_sent: usize) {}
    fn complete(&mut self, _report: &UploadReport) {}
}

/// Summary of a finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Bytes uploaded
    pub bytes: usize,
    /// Time from the first chunk to the last acknowledgement
    pub elapsed: Duration,
    /// Hash from the image's TLV area
    pub hash: ImageHash,
    /// Times the device answered with an offset lower than the current one
    pub repeated_offsets: usize,
}

impl UploadReport {
    /// Average throughput in bytes per second
    ///
    /// Uploads faster than a second count as taking one second.
    pub fn throughput(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64().max(1.0);
        self.bytes as f64 / seconds
    }

    /// Throughput as text, e.g. `~12.345KiBps`
    pub fn throughput_string(&self) -> String {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

        let mut speed = self.throughput();
        let mut unit = 0;
        while speed >= 1024.0 && unit < UNITS.len() - 1 {
            speed /= 1024.0;
            unit += 1;
        }

        format!("~{}{}ps", (speed * 1000.0).round() / 1000.0, UNITS[unit])
    }
}

/// Image management commands
pub struct ImgGroup<T: Transport> {
    client: GroupClient<T>,
}

impl<T: Transport> ImgGroup<T> {
    /// Create the group, registering its error table
    pub fn new(processor: Rc<Processor<T>>, registry: &mut ErrorRegistry) -> Self {
        registry.register(GROUP_ID_IMG, ERRORS);
        Self {
            client: GroupClient::new(processor, GROUP_ID_IMG),
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

    /// List the image slots
    pub async fn state(&self) -> Result<Vec<ImageState>> {
        let message = self.client.request(Operation::Read, COMMAND_STATE);
        let reply = self.client.send(message).await?;
        parse_images(reply.contents())
    }

    /// Mark an image for test boot, or confirm it
    ///
    /// With no `hash` and `confirm` set, the running image is confirmed.
    /// Returns the slot states after the change.
    pub async fn set_state(&self, hash: Option<&[u8]>, confirm: bool) -> Result<Vec<ImageState>> {
        let mut message = self.client.request(Operation::Write, COMMAND_STATE);
        if let Some(hash) = hash {
            message.push_field("hash", Value::Bytes(hash.to_vec()));
        }
        if confirm {
            message.push_field("confirm", true);
        }

        let reply = self.client.send(message).await?;
        parse_images(reply.contents())
    }

    /// Erase an image slot
    pub async fn erase(&self, slot: u32) -> Result<()> {
        let mut message = self.client.request(Operation::Write, COMMAND_ERASE);
        if slot != DEFAULT_ERASE_SLOT {
            message.push_field("slot", slot);
        }
        self.client.send(message).await?;
        log::info!("Erased slot {}", slot);
        Ok(())
    }

    /// Read the slot layout of every image
    pub async fn slot_info(&self) -> Result<Vec<ImageSlots>> {
        let message = self.client.request(Operation::Read, COMMAND_SLOT_INFO);
        let reply = self.client.send(message).await?;
        let images = reply
            .contents()
            .and_then(|c| cbor::map_get(c, "images"))
            .and_then(Value::as_array)
            .ok_or(TransportError::InvalidResponse)?;

        images
            .iter()
            .map(|v| ImageSlots::from_value(v).ok_or_else(|| TransportError::InvalidResponse.into()))
            .collect()
    }

    /// Upload an MCUboot image
    ///
    /// `image` selects the target image number (0 is the default and is not
    /// sent). With `upgrade_only` the device refuses images that are not
    /// newer than the running one.
    pub async fn upload(
        &self,
        image: u32,
        data: &[u8],
        upgrade_only: bool,
        progress: &mut impl UploadProgress,
    ) -> Result<UploadReport> {
        let endianness = image::extract_header(data)?;
        let hash = image::extract_hash(data, endianness)?;
        let sha = Sha256::digest(data).to_vec();

        log::debug!(
            "img: uploading {} bytes ({:?} image, {:?} hash)",
            data.len(),
            endianness,
            hash.kind
        );

        let start = Instant::now();
        let mut offset = 0usize;
        let mut repeated = 0usize;
        let mut repeated_total = 0usize;
        progress.started(data.len());

        while offset < data.len() {
            let max_size = self.client.max_message_size()?;

            let mut message = self.client.request(Operation::Write, COMMAND_UPLOAD);
            if offset == 0 {
                if image != 0 {
                    message.push_field("image", image);
                }
                message.push_field("len", data.len() as u64);
                message.push_field("sha", Value::Bytes(sha.clone()));
                if upgrade_only {
                    message.push_field("upgrade", true);
                }
            }
            message.push_field("off", offset as u64);

            let mut sized = message.clone();
            sized.finalize()?;
            let chunk = max_size
                .checked_sub(sized.size() + DATA_FIELD_OVERHEAD)
                .filter(|&n| n > 0)
                .ok_or(TransportError::MessageTooLarge)?;

            let end = data.len().min(offset + chunk);
            message.push_field("data", Value::Bytes(data[offset..end].to_vec()));

            let reply = self.client.send(message).await?;
            let next = reply
                .contents()
                .and_then(|c| cbor::get_i64(c, "off"))
                .ok_or(TransportError::InvalidResponse)?;

            // A negative offset leaves the position unchanged
            match usize::try_from(next) {
                Ok(next) if next < offset => {
                    repeated += 1;
                    repeated_total += 1;
                    log::debug!("img: device rewound from {} to {}", offset, next);
                    if repeated > REPEATED_OFFSET_LIMIT {
                        log::warn!(
                            "img: device returned a lower offset {} times in a row",
                            repeated
                        );
                    }
                    offset = next;
                }
                Ok(next) => {
                    repeated = 0;
                    offset = next;
                }
                Err(_) => repeated = 0,
            }

            log::trace!("img: {} of {} bytes acknowledged", offset, data.len());
            progress.progress(offset.min(data.len()));
        }

        let report = UploadReport {
            bytes: data.len(),
            elapsed: start.elapsed(),
            hash,
            repeated_offsets: repeated_total,
        };
        log::info!(
            "Upload of {} bytes complete, {} throughput",
            report.bytes,
            report.throughput_string()
        );
        progress.complete(&report);
        Ok(report)
    }
}

fn parse_images(contents: Option<&Value>) -> Result<Vec<ImageState>> {
    let images = contents
        .and_then(|c| cbor::map_get(c, "images"))
        .and_then(Value::as_array)
        .ok_or(TransportError::InvalidResponse)?;

    images
        .iter()
        .map(|v| ImageState::from_value(v).ok_or_else(|| TransportError::InvalidResponse.into()))
        .collect()
}
