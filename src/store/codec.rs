//! Stored value codec and merge operator
//!
//! Value layout (little-endian):
//! `[PARTITION_HASH:8][UPDATED_AT_NS:8][TTL_SECOND:4][DATA_TYPE:1][VALUE:n]`
//!
//! The header travels with every value so a replica can resolve conflicts
//! (last writer wins on `updated_at_ns`), expire keys, and filter keys by
//! shard without rehashing them.

use crate::binlog::MergeType;
use crate::common::{Error, Result};

pub const HEADER_LEN: usize = 21;

/// One value as stored in the local engine
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub partition_hash: u64,
    pub updated_at_ns: u64,
    pub ttl_second: u32,
    pub data_type: MergeType,
    pub value: Vec<u8>,
}

impl StoredValue {
    pub fn new(partition_hash: u64, updated_at_ns: u64, ttl_second: u32, value: Vec<u8>) -> Self {
        Self {
            partition_hash,
            updated_at_ns,
            ttl_second,
            data_type: MergeType::None,
            value,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(HEADER_LEN + self.value.len());
        b.extend_from_slice(&self.partition_hash.to_le_bytes());
        b.extend_from_slice(&self.updated_at_ns.to_le_bytes());
        b.extend_from_slice(&self.ttl_second.to_le_bytes());
        b.push(self.data_type as i32 as u8);
        b.extend_from_slice(&self.value);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_LEN {
            return Err(Error::Corrupted(format!(
                "stored value too short: {} bytes",
                b.len()
            )));
        }
        let data_type = MergeType::try_from(b[20] as i32)
            .map_err(|_| Error::Corrupted(format!("unknown data type {}", b[20])))?;

        Ok(Self {
            partition_hash: read_u64(&b[0..8]),
            updated_at_ns: read_u64(&b[8..16]),
            ttl_second: read_u32(&b[16..20]),
            data_type,
            value: b[HEADER_LEN..].to_vec(),
        })
    }

    /// Expired once `updated_at + ttl` is in the past. A zero ttl never expires.
    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.ttl_second > 0
            && self
                .updated_at_ns
                .saturating_add(self.ttl_second as u64 * 1_000_000_000)
                < now_ns
    }

    /// Fold one merge operand into this value
    pub fn merge_with(&mut self, operand: &StoredValue) -> Result<()> {
        match operand.data_type {
            MergeType::None => {
                self.value = operand.value.clone();
            }
            MergeType::AppendBytes => {
                self.value.extend_from_slice(&operand.value);
            }
            MergeType::SumFloat64 => {
                let sum = self.as_f64()? + operand.as_f64()?;
                self.value = sum.to_le_bytes().to_vec();
            }
            MergeType::MaxFloat64 => {
                if self.as_f64()? < operand.as_f64()? {
                    self.value = operand.value.clone();
                }
            }
            MergeType::MinFloat64 => {
                if self.as_f64()? > operand.as_f64()? {
                    self.value = operand.value.clone();
                }
            }
        }
        self.data_type = operand.data_type;
        self.updated_at_ns = self.updated_at_ns.max(operand.updated_at_ns);
        Ok(())
    }

    /// Numeric view of the value; an empty value reads as 0.0
    pub fn as_f64(&self) -> Result<f64> {
        match self.value.len() {
            0 => Ok(0.0),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&self.value);
                Ok(f64::from_le_bytes(buf))
            }
            n => Err(Error::Corrupted(format!(
                "float64 value must be 8 bytes, got {}",
                n
            ))),
        }
    }
}

/// Partition hash straight from encoded bytes, without decoding the value
pub fn partition_hash_of(b: &[u8]) -> Option<u64> {
    if b.len() < 8 {
        return None;
    }
    Some(read_u64(&b[0..8]))
}

/// Merge operator shared by every `LocalStore` backend.
///
/// An absent or expired existing value is replaced by the operand; otherwise
/// the operands are folded in order.
pub fn merge_values(existing: Option<&[u8]>, operands: &[&[u8]], now_ns: u64) -> Result<Vec<u8>> {
    let mut iter = operands.iter();
    let mut merged = match existing {
        Some(b) => {
            let current = StoredValue::from_bytes(b)?;
            if current.is_expired(now_ns) {
                None
            } else {
                Some(current)
            }
        }
        None => None,
    };

    if merged.is_none() {
        match iter.next() {
            Some(first) => merged = Some(StoredValue::from_bytes(first)?),
            None => return Err(Error::Internal("merge without operands".into())),
        }
    }

    let mut merged = merged.ok_or_else(|| Error::Internal("merge produced no value".into()))?;
    for operand in iter {
        merged.merge_with(&StoredValue::from_bytes(operand)?)?;
    }
    Ok(merged.to_bytes())
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    u64::from_le_bytes(buf)
}

fn read_u32(b: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(b);
    u32::from_le_bytes(buf)
}
