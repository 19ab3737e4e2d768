//! Binlog tests: segment rolling, purging and blocking tail reads

use ringkv::binlog::segment::segment_file_name;
use ringkv::binlog::{LogEntry, LogManager, LogPosition};
use ringkv::common::{LogConfig, LogSyncPolicy};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::{assert_pending, assert_ready_ok, task};

fn small_segments(retained_segments: u32) -> LogConfig {
    LogConfig {
        max_segment_size: 200,
        retained_segments,
        sync: LogSyncPolicy::Never,
        sync_interval_ms: 1000,
    }
}

fn entry(i: u64) -> LogEntry {
    LogEntry::put(i, 1_000 + i, 0, format!("key-{}", i).into_bytes(), vec![b'v'; 120])
}

#[tokio::test]
async fn test_roll_purge_and_out_of_sync() {
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(dir.path(), &small_segments(2)).unwrap();

    // every entry is larger than half a segment, so each append rolls
    for i in 0..10 {
        let at = log.append(&entry(i)).unwrap();
        assert_eq!(at, LogPosition::new(i as u32, 0));
    }

    let range = log.segment_range();
    assert_eq!(range.latest, 9);
    assert_eq!(range.earliest, 7);
    assert!(!log.has_segment(0));
    assert!(log.has_segment(7));

    let err = log.tail(0, 0, 10).await.unwrap_err();
    assert!(err.is_out_of_sync());

    let batch = log.tail(7, 0, 10).await.unwrap();
    assert_eq!(batch.entries, vec![entry(7)]);
    assert_eq!(batch.next, LogPosition::new(7, entry(7).frame_len()));
}

#[tokio::test]
async fn test_tail_from_sealed_segment_end_moves_on() {
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(dir.path(), &small_segments(3)).unwrap();
    log.append(&entry(1)).unwrap();
    log.append(&entry(2)).unwrap();

    let end_of_first = entry(1).frame_len();
    let batch = log.tail(0, end_of_first, 10).await.unwrap();
    assert_eq!(batch.entries, vec![entry(2)]);
    assert_eq!(batch.next.segment, 1);
}

#[tokio::test]
async fn test_tail_skips_frame_with_corrupt_length() {
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(dir.path(), &small_segments(3)).unwrap();
    for i in 0..3 {
        log.append(&entry(i)).unwrap();
    }

    // overwrite the length prefix of the only frame in sealed segment 0
    let mut file = OpenOptions::new()
        .write(true)
        .open(dir.path().join(segment_file_name(0)))
        .unwrap();
    file.write_all(&u32::MAX.to_le_bytes()).unwrap();
    file.sync_all().unwrap();

    let skipped = log.tail(0, 0, 10).await.unwrap();
    assert!(skipped.entries.is_empty());
    assert_eq!(skipped.skipped, 1);
    assert_eq!(skipped.next, LogPosition::new(0, entry(0).frame_len()));

    let batch = log.tail(skipped.next.segment, skipped.next.offset, 10).await.unwrap();
    assert_eq!(batch.entries, vec![entry(1)]);
    assert_eq!(batch.next.segment, 1);
}

#[test]
fn test_tail_beyond_last_byte_waits_for_that_offset() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(LogManager::open(dir.path(), &LogConfig::default()).unwrap());
    log.append(&entry(1)).unwrap();
    let beyond = log.position().offset + entry(2).frame_len();

    let mut tail = task::spawn(log.tail(0, beyond, 10));
    assert_pending!(tail.poll());

    // this append ends exactly at the requested offset; nothing to read yet
    log.append(&entry(2)).unwrap();
    assert_pending!(tail.poll());

    log.append(&entry(3)).unwrap();
    assert!(tail.is_woken());
    let batch = assert_ready_ok!(tail.poll());
    assert_eq!(batch.entries, vec![entry(3)]);
    assert_eq!(batch.next, log.position());
}

#[test]
fn test_tail_blocks_until_append() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(LogManager::open(dir.path(), &LogConfig::default()).unwrap());
    log.append(&entry(1)).unwrap();
    let tail_at = log.position();

    let mut tail = task::spawn(log.tail(tail_at.segment, tail_at.offset, 10));
    assert_pending!(tail.poll());

    log.append(&entry(2)).unwrap();
    assert!(tail.is_woken());
    let batch = assert_ready_ok!(tail.poll());
    assert_eq!(batch.entries, vec![entry(2)]);
    assert_eq!(batch.next, log.position());
}

#[test]
fn test_shutdown_wakes_blocked_tail() {
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(dir.path(), &LogConfig::default()).unwrap();

    let mut tail = task::spawn(log.tail(0, 0, 10));
    assert_pending!(tail.poll());

    log.shutdown();
    assert!(tail.is_woken());
    match tail.poll() {
        std::task::Poll::Ready(Err(e)) => assert!(e.is_shutdown()),
        other => panic!("expected shutdown, got {:?}", other.map(|r| r.map(|b| b.entries.len()))),
    }
}

#[test]
fn test_reopen_resumes_segment_numbering() {
    let dir = TempDir::new().unwrap();

    {
        let log = LogManager::open(dir.path(), &small_segments(5)).unwrap();
        for i in 0..3 {
            log.append(&entry(i)).unwrap();
        }
        log.shutdown();
    }

    {
        let log = LogManager::open(dir.path(), &small_segments(5)).unwrap();
        let range = log.segment_range();
        assert_eq!((range.earliest, range.latest), (0, 2));
        assert_eq!(log.append(&entry(3)).unwrap(), LogPosition::new(3, 0));
    }
}
