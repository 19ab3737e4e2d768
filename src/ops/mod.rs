//! Operator tooling

pub mod compact;
pub mod verify;

pub use compact::{compact_shard, CompactReport};
pub use verify::{verify_log_dir, SegmentReport, VerifyReport};
