//! MCUboot image header and TLV parsing
//!
//! An MCUboot image starts with a header giving the header size, the size of
//! the protected TLV area and the size of the image body. The unprotected TLV
//! area follows the body and carries, among others, the SHA hash of the
//! image. The byte order of all multi-byte fields follows the target, which is
//! detected from the header magic.
//!
//! Reference: mcuboot/boot/bootutil/include/bootutil/image.h

use crate::error::ImageError;

/// Header magic, version 1
const IMAGE_MAGIC_V1: [u8; 4] = [0x96, 0xF3, 0xB8, 0x3C];
/// Header magic, version 2
const IMAGE_MAGIC: [u8; 4] = [0x96, 0xF3, 0xB8, 0x3D];
/// Magic of an erased or unset header
const IMAGE_MAGIC_NONE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

const HEADER_SIZE_OFFSET: usize = 8;
const PROTECTED_TLV_SIZE_OFFSET: usize = 10;
const IMAGE_SIZE_OFFSET: usize = 12;
/// Bytes of the header needed to read all size fields
const HEADER_FIELDS_END: usize = IMAGE_SIZE_OFFSET + 4;

/// TLV info magic, as stored by a little-endian target
const TLV_INFO_MAGIC_LE: [u8; 2] = [0x07, 0x69];
/// TLV info magic, as stored by a big-endian target
const TLV_INFO_MAGIC_BE: [u8; 2] = [0x69, 0x07];
/// Size of the TLV info header (magic + total length)
const TLV_INFO_SIZE: usize = 4;
/// Size of a TLV entry header (tag, pad, length)
const TLV_ENTRY_HEADER_SIZE: usize = 4;

/// TLV tags carrying an image hash
pub mod tag {
    /// SHA-256 of header and body
    pub const SHA256: u8 = 0x10;
    /// SHA-384 of header and body
    pub const SHA384: u8 = 0x11;
    /// SHA-512 of header and body
    pub const SHA512: u8 = 0x12;
}

/// Byte order of an image, derived from its header magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    /// Magic stored most significant byte first
    Big,
    /// Magic stored least significant byte first
    Little,
    /// Header magic is erased; byte order cannot be known from the header
    Undetermined,
}

impl Endianness {
    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endianness::Big => u16::from_be_bytes(bytes),
            // An erased header gives no hint; MCUboot targets are overwhelmingly little endian
            Endianness::Little | Endianness::Undetermined => u16::from_le_bytes(bytes),
        }
    }

    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Big => u32::from_be_bytes(bytes),
            Endianness::Little | Endianness::Undetermined => u32::from_le_bytes(bytes),
        }
    }

    fn tlv_info_magic(self) -> [u8; 2] {
        match self {
            Endianness::Big => TLV_INFO_MAGIC_BE,
            Endianness::Little | Endianness::Undetermined => TLV_INFO_MAGIC_LE,
        }
    }
}

/// Hash algorithm of a hash TLV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashKind {
    /// Hash kind for a TLV tag, if the tag carries a hash
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            tag::SHA256 => Some(HashKind::Sha256),
            tag::SHA384 => Some(HashKind::Sha384),
            tag::SHA512 => Some(HashKind::Sha512),
            _ => None,
        }
    }

    /// Digest size in bytes
    pub fn size(self) -> usize {
        match self {
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha512 => 64,
        }
    }
}

/// Image header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Raw magic bytes
    pub magic: [u8; 4],
    /// Byte order
    pub endianness: Endianness,
    /// Size of the header, offset of the image body
    pub header_size: u16,
    /// Size of the protected TLV area
    pub protected_tlv_size: u16,
    /// Size of the image body
    pub image_size: u32,
}

impl ImageHeader {
    /// Offset where the search for the TLV info area starts
    pub fn tlv_area_start(&self) -> usize {
        usize::from(self.header_size) + usize::from(self.protected_tlv_size) + self.image_size as usize
    }
}

/// A single TLV entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvEntry<'a> {
    /// Offset of the entry header in the image
    pub offset: usize,
    /// Entry tag
    pub tag: u8,
    /// Value length
    pub length: u16,
    /// Value bytes
    pub value: &'a [u8],
}

/// Image hash extracted from the TLV area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHash {
    /// Hash algorithm
    pub kind: HashKind,
    /// Digest bytes
    pub value: Vec<u8>,
}

/// Detect the byte order of an image from its header magic
pub fn extract_header(data: &[u8]) -> Result<Endianness, ImageError> {
    let magic: [u8; 4] = data
        .get(..4)
        .and_then(|m| m.try_into().ok())
        .ok_or(ImageError::TooShort {
            needed: 4,
            actual: data.len(),
        })?;

    if magic == IMAGE_MAGIC || magic == IMAGE_MAGIC_V1 {
        return Ok(Endianness::Big);
    }
    if magic == IMAGE_MAGIC_NONE {
        return Ok(Endianness::Undetermined);
    }

    let mut reversed = magic;
    reversed.reverse();
    if reversed == IMAGE_MAGIC || reversed == IMAGE_MAGIC_V1 {
        return Ok(Endianness::Little);
    }

    Err(ImageError::InvalidMagic(magic))
}

/// Parse the image header with a known byte order
pub fn parse_header(data: &[u8], endianness: Endianness) -> Result<ImageHeader, ImageError> {
    if data.len() < HEADER_FIELDS_END {
        return Err(ImageError::TooShort {
            needed: HEADER_FIELDS_END,
            actual: data.len(),
        });
    }

    let header = ImageHeader {
        magic: [data[0], data[1], data[2], data[3]],
        endianness,
        header_size: endianness.read_u16([data[HEADER_SIZE_OFFSET], data[HEADER_SIZE_OFFSET + 1]]),
        protected_tlv_size: endianness.read_u16([
            data[PROTECTED_TLV_SIZE_OFFSET],
            data[PROTECTED_TLV_SIZE_OFFSET + 1],
        ]),
        image_size: endianness.read_u32([
            data[IMAGE_SIZE_OFFSET],
            data[IMAGE_SIZE_OFFSET + 1],
            data[IMAGE_SIZE_OFFSET + 2],
            data[IMAGE_SIZE_OFFSET + 3],
        ]),
    };

    if header.image_size >= i32::MAX as u32 {
        return Err(ImageError::ImageSizeOutOfRange(header.image_size));
    }

    Ok(header)
}

/// Locate the TLV info area
///
/// Returns the offset of the info header and the total area length it
/// declares (which includes the info header itself).
fn find_tlv_area(data: &[u8], header: &ImageHeader) -> Option<(usize, usize)> {
    let magic = header.endianness.tlv_info_magic();
    let mut pos = header.tlv_area_start();

    while pos + TLV_INFO_SIZE <= data.len() {
        if data[pos..pos + 2] == magic {
            let length = header.endianness.read_u16([data[pos + 2], data[pos + 3]]);
            return Some((pos, usize::from(length)));
        }
        pos += 1;
    }

    None
}

/// Iterator over the entries of a TLV area
pub struct TlvIter<'a> {
    data: &'a [u8],
    endianness: Endianness,
    pos: usize,
    end: usize,
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<TlvEntry<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }

        let offset = self.pos;
        let value_start = offset + TLV_ENTRY_HEADER_SIZE;
        if value_start > self.data.len() {
            self.pos = self.end;
            return Some(Err(ImageError::TruncatedTlv(offset)));
        }

        let tag = self.data[offset];
        let length = self
            .endianness
            .read_u16([self.data[offset + 2], self.data[offset + 3]]);
        let value_end = value_start + usize::from(length);
        if value_end > self.data.len() {
            self.pos = self.end;
            return Some(Err(ImageError::TruncatedTlv(offset)));
        }

        self.pos = value_end;
        Some(Ok(TlvEntry {
            offset,
            tag,
            length,
            value: &self.data[value_start..value_end],
        }))
    }
}

/// Iterate over the unprotected TLV entries of an image
pub fn tlv_entries<'a>(data: &'a [u8], header: &ImageHeader) -> Result<TlvIter<'a>, ImageError> {
    let (start, length) = find_tlv_area(data, header).ok_or(ImageError::TlvAreaNotFound)?;
    log::trace!("image: TLV area at 0x{:X}, {} bytes", start, length);

    Ok(TlvIter {
        data,
        endianness: header.endianness,
        pos: start + TLV_INFO_SIZE,
        end: start + length,
    })
}

/// Extract the image hash from the TLV area
///
/// The first SHA-256/384/512 entry of the expected size is the hash. Hash
/// entries of the wrong size are skipped; any hash entry after a valid one
/// makes the image ambiguous and is rejected.
pub fn extract_hash(data: &[u8], endianness: Endianness) -> Result<ImageHash, ImageError> {
    let header = parse_header(data, endianness)?;
    let mut found: Option<ImageHash> = None;

    for entry in tlv_entries(data, &header)? {
        let entry = entry?;
        let Some(kind) = HashKind::from_tag(entry.tag) else {
            continue;
        };

        if found.is_some() {
            return Err(ImageError::DuplicateHash);
        }

        if entry.value.len() == kind.size() {
            found = Some(ImageHash {
                kind,
                value: entry.value.to_vec(),
            });
        } else {
            log::debug!(
                "image: ignoring {:?} TLV with length {} at 0x{:X}",
                kind,
                entry.length,
                entry.offset
            );
        }
    }

    found.ok_or(ImageError::HashNotFound)
}
