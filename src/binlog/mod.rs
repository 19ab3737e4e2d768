//! Segmented replication log
//!
//! - `entry`: `LogEntry` message, CRC and length-prefixed framing
//! - `segment`: segment file naming, reads, the active segment writer
//! - `manager`: `LogManager`, append/roll/purge and blocking tail reads

pub mod entry;
pub mod manager;
pub mod segment;

pub use entry::{LogEntry, MergeType};
pub use manager::{LogManager, LogPosition, SegmentRange, TailBatch};
pub use segment::SegmentScan;
