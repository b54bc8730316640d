//! SMP message codec
//!
//! Every SMP message starts with a fixed 8-byte header followed by a CBOR
//! payload:
//!
//! ```text
//! [0]    version/op   low 2 bits: operation, bit 0x08: version 2 header
//! [1]    flags        reserved, always 0
//! [2..3] length       payload length, big endian
//! [4..5] group        group ID, big endian
//! [6]    sequence
//! [7]    command ID
//! ```
//!
//! Outgoing messages are built with [`SmpMessage::start`], one or more calls to
//! [`SmpMessage::push_field`] and a final [`SmpMessage::finalize`]. Incoming
//! messages are assembled incrementally with [`SmpMessage::append`] as bytes
//! arrive from a transport.

use ciborium::value::Value;
use heapless::Vec as HeaplessVec;

use crate::error::TransportError;

/// Size of the SMP header in bytes
pub const SMP_HEADER_SIZE: usize = 8;

const OFFSET_VERSION_OP: usize = 0;
const OFFSET_FLAGS: usize = 1;
const OFFSET_LENGTH: usize = 2;
const OFFSET_GROUP: usize = 4;
const OFFSET_SEQUENCE: usize = 6;
const OFFSET_COMMAND: usize = 7;

const OP_BITS: u8 = 0x03;
const VERSION_2_BIT: u8 = 0x08;

/// SMP operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read request
    Read = 0,
    /// Response to a read request
    ReadResponse = 1,
    /// Write request
    Write = 2,
    /// Response to a write request
    WriteResponse = 3,
}

impl Operation {
    /// Decode an operation from the low two bits of a header byte
    pub fn from_bits(bits: u8) -> Self {
        match bits & OP_BITS {
            0 => Operation::Read,
            1 => Operation::ReadResponse,
            2 => Operation::Write,
            _ => Operation::WriteResponse,
        }
    }

    /// Operation a device uses to answer this one
    pub fn response(self) -> Self {
        response_op(self)
    }
}

/// Map a request operation to the operation of its response
///
/// Reads are answered with `ReadResponse`; everything else with
/// `WriteResponse`.
pub fn response_op(op: Operation) -> Operation {
    match op {
        Operation::Read => Operation::ReadResponse,
        _ => Operation::WriteResponse,
    }
}

/// SMP header format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Original SMP: errors reported as a bare `rc`
    V1,
    /// SMP version 2: group-scoped `err` maps
    #[default]
    V2,
}

impl ProtocolVersion {
    /// The other version, used when probing what a device supports
    pub fn toggled(self) -> Self {
        match self {
            ProtocolVersion::V1 => ProtocolVersion::V2,
            ProtocolVersion::V2 => ProtocolVersion::V1,
        }
    }

    /// Numeric version (1 or 2)
    pub fn number(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }
}

/// Decoded SMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmpHeader {
    /// Header format version
    pub version: ProtocolVersion,
    /// Operation
    pub op: Operation,
    /// Reserved flags
    pub flags: u8,
    /// Declared payload length
    pub length: u16,
    /// Group ID
    pub group: u16,
    /// Sequence number
    pub sequence: u8,
    /// Command ID within the group
    pub command: u8,
}

impl SmpHeader {
    /// Create a header with zero length and sequence
    pub fn new(op: Operation, version: ProtocolVersion, group: u16, command: u8) -> Self {
        Self {
            version,
            op,
            flags: 0,
            length: 0,
            group,
            sequence: 0,
            command,
        }
    }

    /// Encode the header into its wire form
    pub fn encode(&self) -> [u8; SMP_HEADER_SIZE] {
        let mut bytes = [0u8; SMP_HEADER_SIZE];
        let version_bit = match self.version {
            ProtocolVersion::V1 => 0,
            ProtocolVersion::V2 => VERSION_2_BIT,
        };
        bytes[OFFSET_VERSION_OP] = version_bit | (self.op as u8);
        bytes[OFFSET_FLAGS] = self.flags;
        bytes[OFFSET_LENGTH..OFFSET_LENGTH + 2].copy_from_slice(&self.length.to_be_bytes());
        bytes[OFFSET_GROUP..OFFSET_GROUP + 2].copy_from_slice(&self.group.to_be_bytes());
        bytes[OFFSET_SEQUENCE] = self.sequence;
        bytes[OFFSET_COMMAND] = self.command;
        bytes
    }

    /// Decode a header from its wire form
    pub fn decode(bytes: &[u8; SMP_HEADER_SIZE]) -> Self {
        let version = if bytes[OFFSET_VERSION_OP] & VERSION_2_BIT != 0 {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        };

        Self {
            version,
            op: Operation::from_bits(bytes[OFFSET_VERSION_OP]),
            flags: bytes[OFFSET_FLAGS],
            length: u16::from_be_bytes([bytes[OFFSET_LENGTH], bytes[OFFSET_LENGTH + 1]]),
            group: u16::from_be_bytes([bytes[OFFSET_GROUP], bytes[OFFSET_GROUP + 1]]),
            sequence: bytes[OFFSET_SEQUENCE],
            command: bytes[OFFSET_COMMAND],
        }
    }
}

/// An SMP message: header plus CBOR payload
///
/// A message is *valid* once its header is complete and the accumulated
/// payload length equals the length declared in the header.
#[derive(Debug, Clone)]
pub struct SmpMessage {
    /// Header bytes received so far (receive side only)
    partial_header: HeaplessVec<u8, SMP_HEADER_SIZE>,
    header: SmpHeader,
    header_complete: bool,
    /// Encoded payload bytes
    payload: Vec<u8>,
    /// Fields of an outgoing message
    fields: Vec<(Value, Value)>,
    /// Fields were added since the last finalize
    pending: bool,
    /// Decoded payload, available once the message is valid
    contents: Option<Value>,
}

impl Default for SmpMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl SmpMessage {
    /// Create an empty message, ready to receive bytes with [`append`](Self::append)
    pub fn new() -> Self {
        Self {
            partial_header: HeaplessVec::new(),
            header: SmpHeader::new(Operation::Read, ProtocolVersion::V1, 0, 0),
            header_complete: false,
            payload: Vec::new(),
            fields: Vec::new(),
            pending: false,
            contents: None,
        }
    }

    /// Start an outgoing message with an empty payload map
    pub fn start(op: Operation, version: ProtocolVersion, group: u16, command: u8) -> Self {
        Self {
            header: SmpHeader::new(op, version, group, command),
            header_complete: true,
            ..Self::new()
        }
    }

    /// Assemble a message from a complete byte buffer
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut message = Self::new();
        message.append(data);
        message
    }

    /// Add a field to the payload map of an outgoing message
    ///
    /// Fields are serialized in insertion order by [`finalize`](Self::finalize).
    pub fn push_field(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.push((Value::from(key), value.into()));
        self.pending = true;
    }

    /// Builder-style variant of [`push_field`](Self::push_field)
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.push_field(key, value);
        self
    }

    /// Serialize the payload map and stamp its length into the header
    pub fn finalize(&mut self) -> Result<(), TransportError> {
        let map = Value::Map(self.fields.clone());
        let mut payload = Vec::new();
        ciborium::ser::into_writer(&map, &mut payload)
            .map_err(|_| TransportError::MessageNotValid)?;

        self.header.length =
            u16::try_from(payload.len()).map_err(|_| TransportError::MessageTooLarge)?;
        self.payload = payload;
        self.contents = Some(map);
        self.pending = false;
        Ok(())
    }

    /// Append received bytes
    ///
    /// Completes the header first, consuming only as many bytes as it still
    /// needs, then accumulates payload. The payload is decoded as soon as its
    /// length matches the declared length.
    pub fn append(&mut self, data: &[u8]) {
        let mut rest = data;

        if !self.header_complete {
            let needed = SMP_HEADER_SIZE - self.partial_header.len();
            let take = needed.min(rest.len());
            // Capacity is SMP_HEADER_SIZE and take never exceeds the free space
            let _ = self.partial_header.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if let Ok(bytes) = <[u8; SMP_HEADER_SIZE]>::try_from(self.partial_header.as_slice()) {
                self.header = SmpHeader::decode(&bytes);
                self.header_complete = true;
            }
        }

        self.payload.extend_from_slice(rest);
        self.contents = None;

        if self.is_valid() && !self.payload.is_empty() {
            match ciborium::de::from_reader::<Value, _>(self.payload.as_slice()) {
                Ok(value) => self.contents = Some(value),
                Err(e) => log::debug!("smp: failed to decode payload: {}", e),
            }
        }
    }

    /// Whether the header is complete and the payload matches its declared length
    ///
    /// An outgoing message with fields added after the last
    /// [`finalize`](Self::finalize) is not valid.
    pub fn is_valid(&self) -> bool {
        self.header_complete
            && !self.pending
            && usize::from(self.header.length) == self.payload.len()
    }

    /// Whether the full header has been received
    pub fn header_complete(&self) -> bool {
        self.header_complete
    }

    /// The message header
    pub fn header(&self) -> &SmpHeader {
        &self.header
    }

    /// Header format version
    pub fn version(&self) -> ProtocolVersion {
        self.header.version
    }

    /// Operation
    pub fn op(&self) -> Operation {
        self.header.op
    }

    /// Group ID
    pub fn group(&self) -> u16 {
        self.header.group
    }

    /// Command ID
    pub fn command(&self) -> u8 {
        self.header.command
    }

    /// Sequence number
    pub fn sequence(&self) -> u8 {
        self.header.sequence
    }

    /// Set the sequence number
    pub fn set_sequence(&mut self, sequence: u8) {
        self.header.sequence = sequence;
    }

    /// Set the header format version
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.header.version = version;
    }

    /// Encoded payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decoded payload
    ///
    /// `None` until the message is valid, for an empty payload, or if the
    /// payload is not well-formed CBOR.
    pub fn contents(&self) -> Option<&Value> {
        self.contents.as_ref()
    }

    /// Full wire representation: header followed by payload
    pub fn data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size());
        if self.header_complete {
            data.extend_from_slice(&self.header.encode());
        } else {
            data.extend_from_slice(&self.partial_header);
        }
        data.extend_from_slice(&self.payload);
        data
    }

    /// Size of the wire representation in bytes
    pub fn size(&self) -> usize {
        let header = if self.header_complete {
            SMP_HEADER_SIZE
        } else {
            self.partial_header.len()
        };
        header + self.payload.len()
    }

    /// Reset to an empty receive-side message
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
