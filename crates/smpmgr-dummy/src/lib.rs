//! smpmgr-dummy - In-memory SMP device for testing
//!
//! This crate provides a [`Transport`] that answers SMP requests itself,
//! emulating a small Zephyr/MCUboot target with the OS, image, statistics,
//! settings, shell, enumeration and Zephyr basic groups. It can also
//! misbehave on request (drop requests, send stray replies, ignore version 2
//! headers) to exercise the retry and correlation logic without hardware.

#![warn(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use ciborium::value::Value;
use smpmgr_core::cbor;
use smpmgr_core::image;
use smpmgr_core::message::{Operation, ProtocolVersion, SmpMessage};
use smpmgr_core::{Transport, TransportError};

/// OS management group
const GROUP_OS: u16 = 0;
/// Image management group
const GROUP_IMG: u16 = 1;
const GROUP_STATS: u16 = 2;
const GROUP_SETTINGS: u16 = 3;
const GROUP_SHELL: u16 = 9;
const GROUP_ENUM: u16 = 10;
const GROUP_ZEPHYR: u16 = 63;

const OS_ECHO: u8 = 0;
const OS_TASK_STATS: u8 = 2;
const OS_MEMORY_POOL: u8 = 3;
const OS_DATE_TIME: u8 = 4;
const OS_RESET: u8 = 5;
const OS_MCUMGR_PARAMETERS: u8 = 6;
const OS_APPLICATION_INFO: u8 = 7;
const OS_BOOTLOADER_INFO: u8 = 8;

const IMG_STATE: u8 = 0;
const IMG_UPLOAD: u8 = 1;
const IMG_ERASE: u8 = 5;
const IMG_SLOT_INFO: u8 = 6;

const STATS_GROUP_DATA: u8 = 0;
const STATS_LIST: u8 = 1;

const SETTINGS_READ_WRITE: u8 = 0;
const SETTINGS_DELETE: u8 = 1;
const SETTINGS_COMMIT: u8 = 2;
const SETTINGS_LOAD_SAVE: u8 = 3;

const SHELL_EXECUTE: u8 = 0;

const ENUM_COUNT: u8 = 0;
const ENUM_LIST: u8 = 1;
const ENUM_SINGLE: u8 = 2;
const ENUM_DETAILS: u8 = 3;

const ZEPHYR_STORAGE_ERASE: u8 = 0;

/// Generic rc values
const RC_EINVAL: i32 = 3;
const RC_ENOENT: i32 = 5;
const RC_ENOTSUP: i32 = 8;

/// Group rc values, version 2 only
const OS_RC_INVALID_FORMAT: i32 = 2;
const OS_RC_QUERY_YIELDS_NO_ANSWER: i32 = 3;
const IMG_RC_NO_IMAGE: i32 = 3;
const IMG_RC_INVALID_OFFSET: i32 = 20;
const IMG_RC_INVALID_LENGTH: i32 = 21;
const STATS_RC_INVALID_GROUP: i32 = 2;
const SETTINGS_RC_KEY_NOT_FOUND: i32 = 3;
const SHELL_RC_EMPTY_COMMAND: i32 = 3;
const ENUM_RC_INDEX_TOO_LARGE: i32 = 4;

/// Slot that receives uploads
const UPLOAD_SLOT: u32 = 1;

/// Size of each image slot
const SLOT_SIZE: u64 = 0x40000;

/// Statistics group the device reports
const STATS_GROUP: &str = "smp_svr_stats";

/// Return code of a shell command that does not exist (-ENOEXEC)
const SHELL_RET_NOT_FOUND: i32 = -8;

/// Groups the device supports: ID, name and number of handlers
const SUPPORTED_GROUPS: &[(u16, &str, u32)] = &[
    (GROUP_OS, "os", 7),
    (GROUP_IMG, "img", 4),
    (GROUP_STATS, "stat", 2),
    (GROUP_SETTINGS, "settings", 4),
    (GROUP_SHELL, "shell", 1),
    (GROUP_ENUM, "enum", 4),
    (GROUP_ZEPHYR, "zephyr", 1),
];

/// Configuration for the dummy device
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Answer requests with a version 2 header; when false they are ignored
    pub supports_v2: bool,
    /// Reported `buf_size` MCUmgr parameter
    pub buf_size: u32,
    /// Reported `buf_count` MCUmgr parameter
    pub buf_count: u32,
    /// Most bytes of each upload chunk the device accepts
    pub upload_chunk_limit: Option<usize>,
    /// Image in the primary slot
    pub primary_image: DummyImage,
    /// Clock reading reported before any date-time write
    pub date_time: String,
    /// Stored settings, by key
    pub settings: BTreeMap<String, Vec<u8>>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            supports_v2: true,
            buf_size: 2048,
            buf_count: 4,
            upload_chunk_limit: None,
            primary_image: DummyImage {
                slot: 0,
                version: "1.0.0".to_string(),
                hash: vec![0x11; 32],
                bootable: true,
                pending: false,
                confirmed: true,
                active: true,
                permanent: false,
            },
            date_time: "2026-01-01T00:00:00".to_string(),
            settings: BTreeMap::from([("app/name".to_string(), b"dummy".to_vec())]),
        }
    }
}

/// An image slot as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyImage {
    /// Slot number
    pub slot: u32,
    /// Version string
    pub version: String,
    /// Image hash
    pub hash: Vec<u8>,
    /// Image can be booted
    pub bootable: bool,
    /// Image is marked for test boot
    pub pending: bool,
    /// Image is confirmed
    pub confirmed: bool,
    /// Image is running
    pub active: bool,
    /// Pending image will be made permanent
    pub permanent: bool,
}

impl DummyImage {
    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::from("slot"), Value::from(self.slot)),
            (Value::from("version"), Value::from(self.version.as_str())),
            (Value::from("hash"), Value::Bytes(self.hash.clone())),
            (Value::from("bootable"), Value::from(self.bootable)),
            (Value::from("pending"), Value::from(self.pending)),
            (Value::from("confirmed"), Value::from(self.confirmed)),
            (Value::from("active"), Value::from(self.active)),
            (Value::from("permanent"), Value::from(self.permanent)),
        ])
    }
}

/// Build a little-endian MCUboot image with a `body_size` byte body and a
/// single SHA-256 hash TLV holding `hash`
pub fn sample_image(body_size: u32, hash: [u8; 32]) -> Vec<u8> {
    const HEADER_SIZE: u16 = 32;

    let mut data = vec![0u8; usize::from(HEADER_SIZE)];
    data[0..4].copy_from_slice(&[0x3D, 0xB8, 0xF3, 0x96]);
    data[8..10].copy_from_slice(&HEADER_SIZE.to_le_bytes());
    data[12..16].copy_from_slice(&body_size.to_le_bytes());
    data.extend((0..body_size).map(|i| (i % 251) as u8));

    let tlv_total = (4 + 4 + hash.len()) as u16;
    data.extend_from_slice(&[0x07, 0x69]);
    data.extend_from_slice(&tlv_total.to_le_bytes());
    data.extend_from_slice(&[image::tag::SHA256, 0]);
    data.extend_from_slice(&(hash.len() as u16).to_le_bytes());
    data.extend_from_slice(&hash);
    data
}

/// State of an upload in progress
#[derive(Debug, Default)]
struct Upload {
    image: u64,
    length: usize,
    sha: Vec<u8>,
    upgrade: bool,
    data: Vec<u8>,
}

/// Error reply for a request
enum Failure {
    /// Generic rc, in the top-level `rc` field for either version
    Rc(i32),
    /// Group rc; a bare generic `rc` for version 1 requests
    Group { v1: i32, v2: i32 },
}

/// In-memory SMP device
///
/// Replies are produced synchronously in [`Transport::send`] and handed out
/// by [`Transport::receive`]. With no reply queued, `receive` waits for the
/// full timeout and fails with [`TransportError::Timeout`].
#[derive(Debug)]
pub struct DummyDevice {
    config: DummyConfig,
    connected: bool,
    outbox: VecDeque<SmpMessage>,
    injected: VecDeque<SmpMessage>,
    requests: Vec<SmpMessage>,
    drop_requests: usize,
    rewind_to: Option<usize>,
    images: Vec<DummyImage>,
    upload: Option<Upload>,
    completed_upload: Option<Upload>,
    resets: usize,
    mtu: Option<usize>,
    date_time: String,
    settings: BTreeMap<String, Vec<u8>>,
    saved_settings: BTreeMap<String, Vec<u8>>,
    settings_commits: usize,
    storage_erases: usize,
}

impl DummyDevice {
    /// Create a connected device with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let images = vec![config.primary_image.clone()];
        let date_time = config.date_time.clone();
        let settings = config.settings.clone();
        Self {
            config,
            connected: true,
            outbox: VecDeque::new(),
            injected: VecDeque::new(),
            requests: Vec::new(),
            drop_requests: 0,
            rewind_to: None,
            images,
            upload: None,
            completed_upload: None,
            resets: 0,
            mtu: None,
            date_time,
            saved_settings: settings.clone(),
            settings,
            settings_commits: 0,
            storage_erases: 0,
        }
    }

    /// Create a connected device with the default configuration
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Ignore the next `count` requests without replying
    pub fn drop_next(&mut self, count: usize) {
        self.drop_requests = count;
    }

    /// Queue a reply to be delivered ahead of the answer to the next request
    pub fn inject_reply(&mut self, message: SmpMessage) {
        self.injected.push_back(message);
    }

    /// Make the next upload reply report `offset` instead of the real one
    pub fn rewind_upload(&mut self, offset: usize) {
        self.rewind_to = Some(offset);
    }

    /// Limit message size the way a link MTU would
    ///
    /// Requests larger than `mtu` are rejected with
    /// [`TransportError::MessageTooLarge`].
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = Some(mtu);
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> &[SmpMessage] {
        &self.requests
    }

    /// Number of reset commands handled
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Last date-time written, or the configured one
    pub fn date_time(&self) -> &str {
        &self.date_time
    }

    /// Current value of a setting
    pub fn setting(&self, name: &str) -> Option<&[u8]> {
        self.settings.get(name).map(Vec::as_slice)
    }

    /// Number of settings commits handled
    pub fn settings_commits(&self) -> usize {
        self.settings_commits
    }

    /// Number of storage erase commands handled
    pub fn storage_erases(&self) -> usize {
        self.storage_erases
    }

    /// Image slots as currently reported
    pub fn images(&self) -> &[DummyImage] {
        &self.images
    }

    /// Data of the last completed upload
    pub fn uploaded_data(&self) -> Option<&[u8]> {
        self.completed_upload.as_ref().map(|u| u.data.as_slice())
    }

    /// `sha` field of the last completed upload
    pub fn uploaded_sha(&self) -> Option<&[u8]> {
        self.completed_upload.as_ref().map(|u| u.sha.as_slice())
    }

    /// `image` and `upgrade` fields of the last completed upload
    pub fn uploaded_target(&self) -> Option<(u64, bool)> {
        self.completed_upload.as_ref().map(|u| (u.image, u.upgrade))
    }

    /// Take the next queued reply without waiting
    ///
    /// For bridging the device behind a byte-level link.
    pub fn take_reply(&mut self) -> Option<SmpMessage> {
        self.outbox.pop_front()
    }

    fn reply(request: &SmpMessage, fields: Vec<(Value, Value)>) -> SmpMessage {
        let mut reply = SmpMessage::start(
            request.op().response(),
            request.version(),
            request.group(),
            request.command(),
        );
        reply.set_sequence(request.sequence());
        for (key, value) in fields {
            if let Some(key) = key.as_text() {
                reply.push_field(key, value);
            }
        }
        // Replies are small maps; serialization cannot exceed the length field
        let _ = reply.finalize();
        SmpMessage::from_bytes(&reply.data())
    }

    fn error_reply(request: &SmpMessage, failure: Failure) -> SmpMessage {
        let fields = match (failure, request.version()) {
            (Failure::Rc(rc), _) | (Failure::Group { v1: rc, .. }, ProtocolVersion::V1) => {
                vec![(Value::from("rc"), Value::from(rc))]
            }
            (Failure::Group { v2, .. }, ProtocolVersion::V2) => vec![(
                Value::from("err"),
                Value::Map(vec![
                    (Value::from("group"), Value::from(request.group())),
                    (Value::from("rc"), Value::from(v2)),
                ]),
            )],
        };
        Self::reply(request, fields)
    }

    fn handle(&mut self, request: &SmpMessage) -> SmpMessage {
        let empty = Value::Map(Vec::new());
        let body = request.contents().unwrap_or(&empty);

        let result = match (request.group(), request.command(), request.op()) {
            (GROUP_OS, OS_ECHO, Operation::Write) => self.echo(body),
            (GROUP_OS, OS_RESET, Operation::Write) => {
                self.resets += 1;
                log::debug!("dummy: reset requested");
                Ok(Vec::new())
            }
            (GROUP_OS, OS_MCUMGR_PARAMETERS, Operation::Read) => Ok(vec![
                (Value::from("buf_size"), Value::from(self.config.buf_size)),
                (Value::from("buf_count"), Value::from(self.config.buf_count)),
            ]),
            (GROUP_OS, OS_TASK_STATS, Operation::Read) => Ok(Self::task_stats()),
            (GROUP_OS, OS_MEMORY_POOL, Operation::Read) => Ok(Self::memory_pool()),
            (GROUP_OS, OS_DATE_TIME, Operation::Read) => Ok(vec![(
                Value::from("datetime"),
                Value::from(self.date_time.as_str()),
            )]),
            (GROUP_OS, OS_DATE_TIME, Operation::Write) => self.set_date_time(body),
            (GROUP_OS, OS_APPLICATION_INFO, Operation::Read) => Self::application_info(body),
            (GROUP_OS, OS_BOOTLOADER_INFO, Operation::Read) => Self::bootloader_info(body),
            (GROUP_IMG, IMG_STATE, Operation::Read) => Ok(self.image_state()),
            (GROUP_IMG, IMG_STATE, Operation::Write) => self.set_image_state(body),
            (GROUP_IMG, IMG_UPLOAD, Operation::Write) => self.upload_chunk(body),
            (GROUP_IMG, IMG_ERASE, Operation::Write) => self.erase(body),
            (GROUP_IMG, IMG_SLOT_INFO, Operation::Read) => Ok(Self::slot_info()),
            (GROUP_STATS, STATS_GROUP_DATA, Operation::Read) => self.stats_group(body),
            (GROUP_STATS, STATS_LIST, Operation::Read) => Ok(vec![(
                Value::from("stat_list"),
                Value::Array(vec![Value::from(STATS_GROUP)]),
            )]),
            (GROUP_SETTINGS, SETTINGS_READ_WRITE, Operation::Read) => self.read_setting(body),
            (GROUP_SETTINGS, SETTINGS_READ_WRITE, Operation::Write) => self.write_setting(body),
            (GROUP_SETTINGS, SETTINGS_DELETE, Operation::Write) => self.delete_setting(body),
            (GROUP_SETTINGS, SETTINGS_COMMIT, Operation::Write) => {
                self.settings_commits += 1;
                Ok(Vec::new())
            }
            (GROUP_SETTINGS, SETTINGS_LOAD_SAVE, Operation::Read) => {
                self.settings = self.saved_settings.clone();
                Ok(Vec::new())
            }
            (GROUP_SETTINGS, SETTINGS_LOAD_SAVE, Operation::Write) => {
                self.saved_settings = self.settings.clone();
                Ok(Vec::new())
            }
            (GROUP_SHELL, SHELL_EXECUTE, Operation::Write) => Self::shell_execute(body),
            (GROUP_ENUM, ENUM_COUNT, Operation::Read) => Ok(vec![(
                Value::from("count"),
                Value::from(SUPPORTED_GROUPS.len() as u64),
            )]),
            (GROUP_ENUM, ENUM_LIST, Operation::Read) => Ok(vec![(
                Value::from("groups"),
                Value::Array(
                    SUPPORTED_GROUPS
                        .iter()
                        .map(|&(id, _, _)| Value::from(id))
                        .collect(),
                ),
            )]),
            (GROUP_ENUM, ENUM_SINGLE, Operation::Read) => Self::enum_single(body),
            (GROUP_ENUM, ENUM_DETAILS, Operation::Read) => Ok(Self::enum_details()),
            (GROUP_ZEPHYR, ZEPHYR_STORAGE_ERASE, Operation::Write) => {
                self.storage_erases += 1;
                self.settings.clear();
                self.saved_settings.clear();
                log::debug!("dummy: storage erased");
                Ok(Vec::new())
            }
            _ => Err(Failure::Rc(RC_ENOTSUP)),
        };

        match result {
            Ok(fields) => Self::reply(request, fields),
            Err(failure) => Self::error_reply(request, failure),
        }
    }

    fn echo(&self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let text = cbor::get_text(body, "d").ok_or(Failure::Rc(RC_EINVAL))?;
        Ok(vec![(Value::from("r"), Value::from(text))])
    }

    fn task_stats() -> Vec<(Value, Value)> {
        let task = |prio: u32, tid: u32, stkuse: u32, stksiz: u32, cswcnt: u32| {
            Value::Map(vec![
                (Value::from("prio"), Value::from(prio)),
                (Value::from("tid"), Value::from(tid)),
                (Value::from("state"), Value::from(0u32)),
                (Value::from("stkuse"), Value::from(stkuse)),
                (Value::from("stksiz"), Value::from(stksiz)),
                (Value::from("cswcnt"), Value::from(cswcnt)),
                (Value::from("runtime"), Value::from(0u32)),
            ])
        };
        vec![(
            Value::from("tasks"),
            Value::Map(vec![
                (Value::from("idle"), task(15, 0, 48, 320, 1200)),
                (Value::from("main"), task(0, 1, 712, 2048, 35)),
            ]),
        )]
    }

    fn memory_pool() -> Vec<(Value, Value)> {
        vec![(
            Value::from("heap"),
            Value::Map(vec![
                (Value::from("blksiz"), Value::from(8u32)),
                (Value::from("nblks"), Value::from(512u32)),
                (Value::from("nfree"), Value::from(384u32)),
                (Value::from("min"), Value::from(256u32)),
            ]),
        )]
    }

    fn set_date_time(&mut self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let date_time = cbor::get_text(body, "datetime").ok_or(Failure::Rc(RC_EINVAL))?;
        self.date_time = date_time.to_string();
        Ok(Vec::new())
    }

    /// `uname`-style system information, one word per format letter
    fn application_info(body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let format = cbor::get_text(body, "format").unwrap_or("s");
        let format = if format == "a" { "snrvbmpio" } else { format };

        let words = format
            .chars()
            .map(|c| match c {
                's' | 'o' => Ok("Zephyr"),
                'n' => Ok("dummy"),
                'r' => Ok("3.7.0"),
                'v' => Ok("v3.7.0"),
                'b' => Ok("2026-01-01"),
                'm' => Ok("arm"),
                'p' => Ok("cortex-m4"),
                'i' => Ok("dummy_board"),
                _ => Err(Failure::Group {
                    v1: RC_EINVAL,
                    v2: OS_RC_INVALID_FORMAT,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(vec![(Value::from("output"), Value::from(words.join(" ")))])
    }

    fn bootloader_info(body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        match cbor::get_text(body, "query").unwrap_or("bootloader") {
            "bootloader" => Ok(vec![(Value::from("bootloader"), Value::from("MCUboot"))]),
            "mode" => Ok(vec![
                (Value::from("mode"), Value::from(0u32)),
                (Value::from("no-downgrade"), Value::from(false)),
            ]),
            _ => Err(Failure::Group {
                v1: RC_EINVAL,
                v2: OS_RC_QUERY_YIELDS_NO_ANSWER,
            }),
        }
    }

    fn slot_info() -> Vec<(Value, Value)> {
        let slots = vec![
            Value::Map(vec![
                (Value::from("slot"), Value::from(0u32)),
                (Value::from("size"), Value::from(SLOT_SIZE)),
            ]),
            Value::Map(vec![
                (Value::from("slot"), Value::from(UPLOAD_SLOT)),
                (Value::from("size"), Value::from(SLOT_SIZE)),
                (Value::from("upload_image_id"), Value::from(0u32)),
            ]),
        ];
        vec![(
            Value::from("images"),
            Value::Array(vec![Value::Map(vec![
                (Value::from("image"), Value::from(0u32)),
                (Value::from("slots"), Value::Array(slots)),
                (Value::from("max_image_size"), Value::from(SLOT_SIZE - 0x1000)),
            ])]),
        )]
    }

    fn stats_group(&self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let name = cbor::get_text(body, "name").ok_or(Failure::Rc(RC_EINVAL))?;
        if name != STATS_GROUP {
            return Err(Failure::Group {
                v1: RC_ENOENT,
                v2: STATS_RC_INVALID_GROUP,
            });
        }

        Ok(vec![
            (Value::from("name"), Value::from(name)),
            (
                Value::from("fields"),
                Value::Map(vec![
                    (Value::from("requests"), Value::from(self.requests.len() as u64)),
                    (Value::from("resets"), Value::from(self.resets as u64)),
                ]),
            ),
        ])
    }

    fn setting_not_found() -> Failure {
        Failure::Group {
            v1: RC_ENOENT,
            v2: SETTINGS_RC_KEY_NOT_FOUND,
        }
    }

    fn read_setting(&self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let name = cbor::get_text(body, "name").ok_or(Failure::Rc(RC_EINVAL))?;
        let value = self.settings.get(name).ok_or_else(Self::setting_not_found)?;

        let mut value = value.clone();
        if let Some(max) = cbor::get_u64(body, "max_size") {
            value.truncate(usize::try_from(max).unwrap_or(usize::MAX));
        }
        Ok(vec![(Value::from("val"), Value::Bytes(value))])
    }

    fn write_setting(&mut self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let name = cbor::get_text(body, "name").ok_or(Failure::Rc(RC_EINVAL))?;
        let value = cbor::get_bytes(body, "val").ok_or(Failure::Rc(RC_EINVAL))?;
        self.settings.insert(name.to_string(), value.to_vec());
        Ok(Vec::new())
    }

    fn delete_setting(&mut self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let name = cbor::get_text(body, "name").ok_or(Failure::Rc(RC_EINVAL))?;
        self.settings
            .remove(name)
            .ok_or_else(Self::setting_not_found)?;
        Ok(Vec::new())
    }

    fn shell_execute(body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let argv: Vec<&str> = cbor::map_get(body, "argv")
            .and_then(Value::as_array)
            .map(|args| args.iter().filter_map(Value::as_text).collect())
            .unwrap_or_default();

        let (output, ret) = match argv.as_slice() {
            [] => {
                return Err(Failure::Group {
                    v1: RC_EINVAL,
                    v2: SHELL_RC_EMPTY_COMMAND,
                })
            }
            ["echo", args @ ..] => (args.join(" "), 0),
            ["kernel", "version"] => ("Zephyr version 3.7.0".to_string(), 0),
            [command, ..] => (format!("{}: command not found", command), SHELL_RET_NOT_FOUND),
        };

        Ok(vec![
            (Value::from("o"), Value::from(output)),
            (Value::from("ret"), Value::from(ret)),
        ])
    }

    fn enum_single(body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let index = cbor::get_u64(body, "index").unwrap_or(0);
        let position = usize::try_from(index)
            .ok()
            .filter(|&i| i < SUPPORTED_GROUPS.len())
            .ok_or(Failure::Group {
                v1: RC_EINVAL,
                v2: ENUM_RC_INDEX_TOO_LARGE,
            })?;

        let (id, _, _) = SUPPORTED_GROUPS[position];
        let mut fields = vec![(Value::from("group"), Value::from(id))];
        if position + 1 == SUPPORTED_GROUPS.len() {
            fields.push((Value::from("end"), Value::from(true)));
        }
        Ok(fields)
    }

    fn enum_details() -> Vec<(Value, Value)> {
        let groups = SUPPORTED_GROUPS
            .iter()
            .map(|&(id, name, handlers)| {
                Value::Map(vec![
                    (Value::from("group"), Value::from(id)),
                    (Value::from("name"), Value::from(name)),
                    (Value::from("handlers"), Value::from(handlers)),
                ])
            })
            .collect();
        vec![(Value::from("groups"), Value::Array(groups))]
    }

    fn image_state(&self) -> Vec<(Value, Value)> {
        let images = self.images.iter().map(DummyImage::to_value).collect();
        vec![(Value::from("images"), Value::Array(images))]
    }

    fn set_image_state(&mut self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let confirm = cbor::get_flag(body, "confirm");
        let hash = cbor::get_bytes(body, "hash");

        let image = match hash {
            Some(hash) => self.images.iter_mut().find(|i| i.hash == hash),
            None if confirm => self.images.iter_mut().find(|i| i.active),
            None => None,
        }
        .ok_or(Failure::Group {
            v1: RC_ENOENT,
            v2: IMG_RC_NO_IMAGE,
        })?;

        if confirm {
            if image.active {
                image.confirmed = true;
            } else {
                image.pending = true;
                image.permanent = true;
            }
        } else {
            image.pending = true;
        }

        Ok(self.image_state())
    }

    fn upload_chunk(&mut self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let invalid_offset = Failure::Group {
            v1: RC_EINVAL,
            v2: IMG_RC_INVALID_OFFSET,
        };
        let offset = cbor::get_u64(body, "off").ok_or(invalid_offset)? as usize;
        let data = cbor::get_bytes(body, "data").unwrap_or_default();

        if offset == 0 {
            let length = cbor::get_u64(body, "len").ok_or(Failure::Group {
                v1: RC_EINVAL,
                v2: IMG_RC_INVALID_LENGTH,
            })? as usize;
            self.upload = Some(Upload {
                image: cbor::get_u64(body, "image").unwrap_or(0),
                length,
                sha: cbor::get_bytes(body, "sha").unwrap_or_default().to_vec(),
                upgrade: cbor::get_flag(body, "upgrade"),
                data: Vec::with_capacity(length),
            });
        }

        let upload = self.upload.as_mut().ok_or(Failure::Group {
            v1: RC_EINVAL,
            v2: IMG_RC_INVALID_OFFSET,
        })?;

        // Out of order chunks are answered with the offset the device expects
        if offset == upload.data.len() {
            let accepted = self
                .config
                .upload_chunk_limit
                .map_or(data.len(), |limit| limit.min(data.len()));
            let room = upload.length.saturating_sub(upload.data.len());
            upload.data.extend_from_slice(&data[..accepted.min(room)]);
        }

        let mut next = upload.data.len();
        if upload.data.len() == upload.length {
            self.finish_upload();
        }

        if let Some(rewind) = self.rewind_to.take() {
            next = rewind;
            if let Some(upload) = self.upload.as_mut() {
                upload.data.truncate(rewind);
            }
        }

        Ok(vec![(Value::from("off"), Value::from(next as u64))])
    }

    fn finish_upload(&mut self) {
        let Some(upload) = self.upload.take() else {
            return;
        };

        let hash = image::extract_header(&upload.data)
            .and_then(|endianness| image::extract_hash(&upload.data, endianness))
            .map(|hash| hash.value)
            .unwrap_or_default();
        log::debug!("dummy: upload of {} bytes complete", upload.data.len());

        self.images.retain(|i| i.slot != UPLOAD_SLOT);
        self.images.push(DummyImage {
            slot: UPLOAD_SLOT,
            version: "0.0.0".to_string(),
            hash,
            bootable: true,
            pending: false,
            confirmed: false,
            active: false,
            permanent: false,
        });
        self.completed_upload = Some(upload);
    }

    fn erase(&mut self, body: &Value) -> Result<Vec<(Value, Value)>, Failure> {
        let slot = cbor::get_u64(body, "slot").unwrap_or(u64::from(UPLOAD_SLOT));
        if slot != u64::from(UPLOAD_SLOT) {
            return Err(Failure::Rc(RC_EINVAL));
        }
        self.upload = None;
        self.images.retain(|i| i.slot != UPLOAD_SLOT);
        Ok(Vec::new())
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new_default()
    }
}

impl Transport for DummyDevice {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Err(TransportError::AlreadyConnected);
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self, force: bool) -> Result<(), TransportError> {
        if !self.connected && !force {
            return Err(TransportError::NotConnected);
        }
        self.connected = false;
        self.outbox.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, message: &SmpMessage) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.mtu.is_some_and(|mtu| message.size() > mtu) {
            return Err(TransportError::MessageTooLarge);
        }

        // Parse the wire form, as a real device would
        let request = SmpMessage::from_bytes(&message.data());
        self.requests.push(request.clone());

        if self.drop_requests > 0 {
            self.drop_requests -= 1;
            log::debug!("dummy: dropping request seq {}", request.sequence());
            return Ok(());
        }

        if request.version() == ProtocolVersion::V2 && !self.config.supports_v2 {
            log::debug!("dummy: ignoring version 2 request");
            return Ok(());
        }

        let reply = self.handle(&request);
        self.outbox.extend(self.injected.drain(..));
        self.outbox.push_back(reply);
        Ok(())
    }

    async fn receive(&mut self, timeout_ms: u32) -> Result<SmpMessage, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(reply) = self.outbox.pop_front() {
            return Ok(reply);
        }
        tokio::time::sleep(Duration::from_millis(u64::from(timeout_ms))).await;
        Err(TransportError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(op: Operation, version: ProtocolVersion, group: u16, command: u8) -> SmpMessage {
        let mut message = SmpMessage::start(op, version, group, command);
        message.finalize().unwrap();
        message
    }

    #[tokio::test]
    async fn test_echo() {
        let mut device = DummyDevice::new_default();
        let mut message = SmpMessage::start(Operation::Write, ProtocolVersion::V2, GROUP_OS, OS_ECHO)
            .with_field("d", "ping");
        message.set_sequence(7);
        message.finalize().unwrap();

        device.send(&message).unwrap();
        let reply = device.receive(100).await.unwrap();
        assert_eq!(reply.op(), Operation::WriteResponse);
        assert_eq!(reply.sequence(), 7);
        assert_eq!(cbor::get_text(reply.contents().unwrap(), "r"), Some("ping"));
    }

    #[tokio::test]
    async fn test_error_formats() {
        let mut device = DummyDevice::new_default();

        device
            .send(&request(Operation::Read, ProtocolVersion::V1, 77, 0))
            .unwrap();
        let reply = device.receive(100).await.unwrap();
        assert_eq!(cbor::get_i64(reply.contents().unwrap(), "rc"), Some(8));

        device
            .send(&request(Operation::Write, ProtocolVersion::V2, GROUP_IMG, IMG_STATE))
            .unwrap();
        let reply = device.receive(100).await.unwrap();
        let err = cbor::map_get(reply.contents().unwrap(), "err").unwrap();
        assert_eq!(cbor::get_i64(err, "group"), Some(1));
        assert_eq!(cbor::get_i64(err, "rc"), Some(IMG_RC_NO_IMAGE as i64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_times_out() {
        let mut device = DummyDevice::new_default();
        device.drop_next(1);
        device
            .send(&request(Operation::Read, ProtocolVersion::V2, GROUP_OS, OS_MCUMGR_PARAMETERS))
            .unwrap();
        assert_eq!(device.receive(500).await.unwrap_err(), TransportError::Timeout);
        assert_eq!(device.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_v2_unsupported() {
        let mut device = DummyDevice::new(DummyConfig {
            supports_v2: false,
            ..DummyConfig::default()
        });
        device
            .send(&request(Operation::Read, ProtocolVersion::V2, GROUP_OS, OS_MCUMGR_PARAMETERS))
            .unwrap();
        assert!(device.receive(100).await.is_err());

        device
            .send(&request(Operation::Read, ProtocolVersion::V1, GROUP_OS, OS_MCUMGR_PARAMETERS))
            .unwrap();
        let reply = device.receive(100).await.unwrap();
        assert_eq!(cbor::get_u64(reply.contents().unwrap(), "buf_size"), Some(2048));
    }

    #[tokio::test]
    async fn test_injected_reply_first() {
        let mut device = DummyDevice::new_default();
        let stray = request(Operation::ReadResponse, ProtocolVersion::V2, 9, 9);
        device.inject_reply(stray.clone());
        device
            .send(&request(Operation::Read, ProtocolVersion::V2, GROUP_IMG, IMG_STATE))
            .unwrap();

        assert_eq!(device.receive(100).await.unwrap().group(), 9);
        assert_eq!(device.receive(100).await.unwrap().group(), GROUP_IMG);
    }

    #[tokio::test]
    async fn test_upload_chunks() {
        let mut device = DummyDevice::new_default();
        let payload: Vec<u8> = (0..100u8).collect();

        let mut first = SmpMessage::start(Operation::Write, ProtocolVersion::V2, GROUP_IMG, IMG_UPLOAD)
            .with_field("len", 100u64)
            .with_field("off", 0u64)
            .with_field("data", Value::Bytes(payload[..60].to_vec()));
        first.finalize().unwrap();
        device.send(&first).unwrap();
        let reply = device.receive(100).await.unwrap();
        assert_eq!(cbor::get_u64(reply.contents().unwrap(), "off"), Some(60));

        // Wrong offset is answered with the expected one
        let mut wrong = SmpMessage::start(Operation::Write, ProtocolVersion::V2, GROUP_IMG, IMG_UPLOAD)
            .with_field("off", 10u64)
            .with_field("data", Value::Bytes(vec![0; 5]));
        wrong.finalize().unwrap();
        device.send(&wrong).unwrap();
        let reply = device.receive(100).await.unwrap();
        assert_eq!(cbor::get_u64(reply.contents().unwrap(), "off"), Some(60));

        let mut last = SmpMessage::start(Operation::Write, ProtocolVersion::V2, GROUP_IMG, IMG_UPLOAD)
            .with_field("off", 60u64)
            .with_field("data", Value::Bytes(payload[60..].to_vec()));
        last.finalize().unwrap();
        device.send(&last).unwrap();
        let reply = device.receive(100).await.unwrap();
        assert_eq!(cbor::get_u64(reply.contents().unwrap(), "off"), Some(100));

        assert_eq!(device.uploaded_data(), Some(payload.as_slice()));
        assert_eq!(device.images().len(), 2);
    }

    #[test]
    fn test_connection_state() {
        let mut device = DummyDevice::new_default();
        assert_eq!(device.connect(), Err(TransportError::AlreadyConnected));
        device.disconnect(false).unwrap();
        assert_eq!(device.disconnect(false), Err(TransportError::NotConnected));
        assert_eq!(
            device.send(&request(Operation::Read, ProtocolVersion::V2, 0, 0)),
            Err(TransportError::NotConnected)
        );
        device.connect().unwrap();
        assert!(device.is_connected());
    }
}
