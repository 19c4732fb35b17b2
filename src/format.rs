//! Byte layout of a data log: file header, record framing and control payloads.
//!
//! Every integer is little-endian. Record header fields are written with the
//! fewest bytes that hold the value; the leading descriptor byte says how many.

use crate::{error::DataLogError, HEADER_STRING, HEADER_VERSION};

const MAX_ONE_BYTE: u64 = 256u64;
const MAX_TWO_BYTES: u64 = 256u64.pow(2);
const MAX_THREE_BYTES: u64 = 256u64.pow(3);
const MAX_FOUR_BYTES: u64 = 256u64.pow(4);
const MAX_FIVE_BYTES: u64 = 256u64.pow(5);
const MAX_SIX_BYTES: u64 = 256u64.pow(6);
const MAX_SEVEN_BYTES: u64 = 256u64.pow(7);

/// Magic, version and extra header length.
pub const HEADER_SIZE: usize = 12;

pub const CONTROL_START: u8 = 0;
pub const CONTROL_FINISH: u8 = 1;
pub const CONTROL_SET_METADATA: u8 = 2;

/// Largest payload a single record may carry.
#[cfg(not(test))]
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;
#[cfg(test)]
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Sub-type byte plus entry id.
pub const FINISH_PAYLOAD_SIZE: usize = 5;
/// Sub-type, entry id and three empty strings.
pub const MIN_START_PAYLOAD_SIZE: usize = 17;
/// Sub-type, entry id and one empty string.
pub const MIN_SET_METADATA_PAYLOAD_SIZE: usize = 9;

/// Number of bytes needed to hold `num`, between 1 and 8.
#[must_use]
pub fn int_len(num: u64) -> usize {
    match num {
        0..MAX_ONE_BYTE => 1,
        MAX_ONE_BYTE..MAX_TWO_BYTES => 2,
        MAX_TWO_BYTES..MAX_THREE_BYTES => 3,
        MAX_THREE_BYTES..MAX_FOUR_BYTES => 4,
        MAX_FOUR_BYTES..MAX_FIVE_BYTES => 5,
        MAX_FIVE_BYTES..MAX_SIX_BYTES => 6,
        MAX_SIX_BYTES..MAX_SEVEN_BYTES => 7,
        _ => 8,
    }
}

/// Appends the low `len` bytes of `num`.
fn write_int(buf: &mut Vec<u8>, num: u64, len: usize) {
    buf.extend_from_slice(&num.to_le_bytes()[..len]);
}

/// Reads up to 8 bytes as a little-endian integer.
///
/// Preconditions: `bytes.len() <= 8`
#[must_use]
pub fn read_int(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8, "Invalid variable int length {}", bytes.len());

    let mut final_buf = [0u8; 8];
    final_buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(final_buf)
}

/// Reads a 4-byte little-endian integer at `pos`, if there is room for one.
#[must_use]
pub fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Field widths packed into a record's leading descriptor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthDescriptor {
    pub entry_len: usize,
    pub size_len: usize,
    pub timestamp_len: usize,
}

impl LengthDescriptor {
    #[must_use]
    pub fn for_fields(entry: u32, size: u32, timestamp: u64) -> Self {
        LengthDescriptor {
            entry_len: int_len(entry.into()),
            size_len: int_len(size.into()),
            timestamp_len: int_len(timestamp),
        }
    }

    /// Decodes a descriptor byte. Returns `None` when the reserved bit is set.
    #[must_use]
    pub fn decode(bitfield: u8) -> Option<Self> {
        if bitfield & 0x80 != 0 {
            return None;
        }

        Some(LengthDescriptor {
            entry_len: usize::from(bitfield & 0x3) + 1,
            size_len: usize::from((bitfield >> 2) & 0x3) + 1,
            timestamp_len: usize::from((bitfield >> 4) & 0x7) + 1,
        })
    }

    #[must_use]
    pub fn encode(self) -> u8 {
        debug_assert!((1..=4).contains(&self.entry_len));
        debug_assert!((1..=4).contains(&self.size_len));
        debug_assert!((1..=8).contains(&self.timestamp_len));

        (self.entry_len - 1) as u8
            | ((self.size_len - 1) as u8) << 2
            | ((self.timestamp_len - 1) as u8) << 4
    }

    /// Size of the whole record header, descriptor byte included.
    #[must_use]
    pub fn header_len(self) -> usize {
        1 + self.entry_len + self.size_len + self.timestamp_len
    }
}

/// Checks that a payload fits in a record and returns its size field.
pub fn payload_size(size: usize) -> Result<u32, DataLogError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(DataLogError::PayloadTooLarge(size));
    }

    u32::try_from(size).map_err(|_| DataLogError::PayloadTooLarge(size))
}

/// Size on the wire of a record carrying `size` payload bytes.
#[must_use]
pub fn record_len(entry: u32, size: u32, timestamp: u64) -> usize {
    LengthDescriptor::for_fields(entry, size, timestamp).header_len() + size as usize
}

/// Appends a record header. The caller must follow it with exactly `size` bytes.
pub fn write_record_header(buf: &mut Vec<u8>, entry: u32, size: u32, timestamp: u64) {
    let descriptor = LengthDescriptor::for_fields(entry, size, timestamp);

    buf.push(descriptor.encode());
    write_int(buf, entry.into(), descriptor.entry_len);
    write_int(buf, size.into(), descriptor.size_len);
    write_int(buf, timestamp, descriptor.timestamp_len);
}

/// Appends the file header that starts every log segment.
pub fn write_file_header(buf: &mut Vec<u8>, extra_header: &str) {
    buf.extend_from_slice(HEADER_STRING);
    buf.extend_from_slice(&HEADER_VERSION.to_le_bytes());
    buf.extend_from_slice(&(extra_header.len() as u32).to_le_bytes());
    buf.extend_from_slice(extra_header.as_bytes());
}

/// Length-prefixed string size on the wire.
#[must_use]
pub fn string_len(value: &str) -> usize {
    4 + value.len()
}

/// Appends a 4-byte length followed by the UTF-8 bytes.
pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Reads a length-prefixed string at `pos`, returning it and the position after it.
#[must_use]
pub fn read_string(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let length = read_u32(data, pos)? as usize;
    let start = pos + 4;
    let end = start.checked_add(length)?;

    Some((data.get(start..end)?, end))
}

#[must_use]
pub fn start_payload_len(name: &str, r#type: &str, metadata: &str) -> usize {
    1 + 4 + string_len(name) + string_len(r#type) + string_len(metadata)
}

pub fn write_start_payload(
    buf: &mut Vec<u8>,
    entry: u32,
    name: &str,
    r#type: &str,
    metadata: &str,
) {
    buf.push(CONTROL_START);
    buf.extend_from_slice(&entry.to_le_bytes());
    write_string(buf, name);
    write_string(buf, r#type);
    write_string(buf, metadata);
}

pub fn write_finish_payload(buf: &mut Vec<u8>, entry: u32) {
    buf.push(CONTROL_FINISH);
    buf.extend_from_slice(&entry.to_le_bytes());
}

#[must_use]
pub fn set_metadata_payload_len(metadata: &str) -> usize {
    1 + 4 + string_len(metadata)
}

pub fn write_set_metadata_payload(buf: &mut Vec<u8>, entry: u32, metadata: &str) {
    buf.push(CONTROL_SET_METADATA);
    buf.extend_from_slice(&entry.to_le_bytes());
    write_string(buf, metadata);
}

/// Returns the version when `data` starts with a supported file header.
#[must_use]
pub fn check_file_header(data: &[u8]) -> Option<u16> {
    if data.len() < HEADER_SIZE || data[..6] != *HEADER_STRING {
        return None;
    }

    Some(u16::from_le_bytes([data[6], data[7]]))
}
