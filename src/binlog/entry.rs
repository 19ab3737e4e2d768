//! Binlog entry and on-disk framing
//!
//! Frame format: `[LEN:u32 LE][LogEntry protobuf]`. The entry itself carries a
//! CRC32 over `key ++ value`, so a frame that decodes cleanly can still be
//! rejected as corrupt.

use crate::common::{crc32_parts, Error, Result};
use prost::Message;

/// Bytes taken by the length prefix in front of every entry
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame payload; anything larger is treated as garbage
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// How a mutation combines with the value already stored under its key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MergeType {
    /// Plain put or delete
    None = 0,
    AppendBytes = 1,
    SumFloat64 = 2,
    MaxFloat64 = 3,
    MinFloat64 = 4,
}

/// One mutation, as written to the binlog and shipped to followers
#[derive(Clone, PartialEq, Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub partition_hash: u64,
    #[prost(uint64, tag = "2")]
    pub updated_at_ns: u64,
    #[prost(uint32, tag = "3")]
    pub ttl_second: u32,
    #[prost(bool, tag = "4")]
    pub is_delete: bool,
    #[prost(bytes = "vec", tag = "5")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub value: Vec<u8>,
    #[prost(uint32, tag = "7")]
    pub crc32: u32,
    #[prost(enumeration = "MergeType", tag = "8")]
    pub merge_type: i32,
}

impl LogEntry {
    pub fn put(
        partition_hash: u64,
        updated_at_ns: u64,
        ttl_second: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Self {
        let mut entry = Self {
            partition_hash,
            updated_at_ns,
            ttl_second,
            is_delete: false,
            key,
            value,
            crc32: 0,
            merge_type: MergeType::None as i32,
        };
        entry.crc32 = entry.checksum();
        entry
    }

    pub fn delete(partition_hash: u64, updated_at_ns: u64, key: Vec<u8>) -> Self {
        let mut entry = Self {
            partition_hash,
            updated_at_ns,
            ttl_second: 0,
            is_delete: true,
            key,
            value: Vec::new(),
            crc32: 0,
            merge_type: MergeType::None as i32,
        };
        entry.crc32 = entry.checksum();
        entry
    }

    pub fn merge(
        partition_hash: u64,
        updated_at_ns: u64,
        merge_type: MergeType,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Self {
        let mut entry = Self::put(partition_hash, updated_at_ns, 0, key, value);
        entry.set_merge_type(merge_type);
        entry
    }

    pub fn is_merge(&self) -> bool {
        !self.is_delete && self.merge_type() != MergeType::None
    }

    /// CRC32 over key and value
    pub fn checksum(&self) -> u32 {
        crc32_parts(&[self.key.as_slice(), self.value.as_slice()])
    }

    pub fn is_valid(&self) -> bool {
        self.crc32 == self.checksum()
    }

    /// Length-prefixed frame ready to be appended to a segment
    pub fn encode_frame(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.extend_from_slice(&self.encode_to_vec());
        buf
    }

    /// Full frame size on disk
    pub fn frame_len(&self) -> u64 {
        (FRAME_HEADER_LEN + self.encoded_len()) as u64
    }
}

/// Outcome of decoding one frame out of a byte buffer
#[derive(Debug)]
pub enum Frame {
    /// A well-formed frame; `len` covers header and payload
    Entry { entry: LogEntry, len: usize },
    /// Header or payload runs past the end of the buffer
    Incomplete,
}

/// Decode the frame at the start of `buf`.
///
/// Returns `Frame::Incomplete` for a torn tail. A payload that does not decode
/// or fails its CRC is reported as `Error::Corrupted`; the caller knows the
/// frame length from the header and may skip over it.
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(Frame::Incomplete);
    }
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    len_buf.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > MAX_FRAME_LEN {
        return Err(Error::Corrupted(format!(
            "frame length {} exceeds limit",
            payload_len
        )));
    }

    let end = FRAME_HEADER_LEN + payload_len as usize;
    if buf.len() < end {
        return Ok(Frame::Incomplete);
    }

    let entry = LogEntry::decode(&buf[FRAME_HEADER_LEN..end])?;
    if !entry.is_valid() {
        return Err(Error::Corrupted(format!(
            "crc mismatch for key {}",
            hex::encode(&entry.key)
        )));
    }
    Ok(Frame::Entry { entry, len: end })
}

/// Payload length announced by a frame header, if the header is readable
pub fn frame_payload_len(buf: &[u8]) -> Option<u32> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    len_buf.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    Some(u32::from_le_bytes(len_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_entry_checksum() {
        let entry = LogEntry::put(11, 100, 0, b"k".to_vec(), b"v".to_vec());
        assert!(entry.is_valid());
        assert!(!entry.is_merge());

        let mut tampered = entry.clone();
        tampered.value = b"w".to_vec();
        assert!(!tampered.is_valid());
    }

    #[test]
    fn test_frame_decodes_back() {
        let entry = LogEntry::merge(
            5,
            9,
            MergeType::SumFloat64,
            b"n".to_vec(),
            1f64.to_le_bytes().to_vec(),
        );
        let frame = entry.encode_frame();
        assert_eq!(frame.len() as u64, entry.frame_len());

        match decode_frame(&frame).unwrap() {
            Frame::Entry { entry: decoded, len } => {
                assert_eq!(len, frame.len());
                assert_eq!(decoded.merge_type(), MergeType::SumFloat64);
                assert!(decoded.is_merge());
                assert_eq!(decoded, entry);
            }
            Frame::Incomplete => panic!("frame should be complete"),
        }
    }

    #[test]
    fn test_torn_frame_is_incomplete() {
        let frame = LogEntry::delete(1, 2, b"gone".to_vec()).encode_frame();
        assert!(matches!(decode_frame(&frame[..2]).unwrap(), Frame::Incomplete));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]).unwrap(),
            Frame::Incomplete
        ));
    }

    #[test]
    fn test_bad_crc_is_corrupted() {
        let mut entry = LogEntry::put(1, 2, 0, b"k".to_vec(), b"v".to_vec());
        entry.crc32 ^= 0xFFFF;
        let frame = entry.encode_frame();
        assert!(matches!(decode_frame(&frame), Err(Error::Corrupted(_))));
        assert_eq!(
            frame_payload_len(&frame),
            Some((frame.len() - FRAME_HEADER_LEN) as u32)
        );
    }
}
