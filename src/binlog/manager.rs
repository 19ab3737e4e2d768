//! Segmented binlog manager
//!
//! One `LogManager` per shard replica. It is both the local write-ahead path
//! (every mutation is appended before it is applied) and the replication feed
//! tailed by every follower of the shard.
//!
//! Appenders publish the new tail position on a `watch` channel; tail readers
//! that are caught up park on that channel until the position moves past their
//! cursor, the log rolls, or the manager shuts down.

use crate::binlog::entry::LogEntry;
use crate::binlog::segment::{self, SegmentWriter};
use crate::common::{Error, LogConfig, LogSyncPolicy, Result, METRICS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A cursor into the log: the next byte to read in `segment`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub segment: u32,
    pub offset: u64,
}

impl LogPosition {
    pub fn new(segment: u32, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Inclusive range of segments still on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    pub earliest: u32,
    pub latest: u32,
    /// Bytes written to `latest`
    pub latest_offset: u64,
}

/// Entries returned by one tail call
#[derive(Debug, Default)]
pub struct TailBatch {
    pub entries: Vec<LogEntry>,
    /// Where the next tail call should start
    pub next: LogPosition,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy)]
struct Published {
    position: LogPosition,
    closed: bool,
}

struct LogState {
    /// segment -> bytes durable in that segment
    segments: BTreeMap<u32, u64>,
    writer: SegmentWriter,
    closed: bool,
}

enum TailStep {
    Read { end: u64 },
    Next,
    Wait,
}

pub struct LogManager {
    dir: PathBuf,
    max_segment_size: u64,
    retained_segments: u32,
    sync_policy: LogSyncPolicy,
    sync_interval: Duration,
    state: Mutex<LogState>,
    published: watch::Sender<Published>,
}

impl LogManager {
    /// Open the log in `dir`, creating segment 0 for a fresh directory.
    ///
    /// The newest existing segment becomes the active one, with any torn
    /// trailing frame truncated.
    pub fn open(dir: impl AsRef<Path>, config: &LogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if config.max_segment_size == 0 {
            return Err(Error::InvalidConfig("max_segment_size must be > 0".into()));
        }
        std::fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        for n in segment::list_segments(&dir)? {
            let len = std::fs::metadata(dir.join(segment::segment_file_name(n)))?.len();
            segments.insert(n, len);
        }
        let current = segments.keys().next_back().copied().unwrap_or(0);

        let writer = SegmentWriter::open(&dir, current)?;
        segments.insert(current, writer.size());

        tracing::info!(
            "opened binlog {} with segments [{}..={}], tail at {}:{}",
            dir.display(),
            segments.keys().next().copied().unwrap_or(current),
            current,
            current,
            writer.size()
        );

        let (published, _) = watch::channel(Published {
            position: LogPosition::new(current, writer.size()),
            closed: false,
        });

        Ok(Self {
            dir,
            max_segment_size: config.max_segment_size,
            retained_segments: config.retained_segments,
            sync_policy: config.sync,
            sync_interval: Duration::from_millis(config.sync_interval_ms.max(1)),
            state: Mutex::new(LogState {
                segments,
                writer,
                closed: false,
            }),
            published,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one entry, rolling to a new segment when the active one is full.
    ///
    /// Returns the position the entry was written at.
    pub fn append(&self, entry: &LogEntry) -> Result<LogPosition> {
        let frame = entry.encode_frame();
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Shutdown(format!("binlog {}", self.dir.display())));
        }

        let size = state.writer.size();
        if size > 0 && size + frame.len() as u64 > self.max_segment_size {
            self.roll(&mut state)?;
        }

        let at = LogPosition::new(state.writer.segment(), state.writer.size());
        let end = state.writer.append(&frame)?;
        if self.sync_policy == LogSyncPolicy::Always {
            state.writer.sync()?;
        }
        state.segments.insert(at.segment, end);

        self.published.send_replace(Published {
            position: LogPosition::new(at.segment, end),
            closed: false,
        });
        drop(state);

        METRICS.entries_appended.inc();
        METRICS.bytes_appended.add(frame.len() as u64);
        Ok(at)
    }

    fn roll(&self, state: &mut LogState) -> Result<()> {
        state.writer.sync()?;
        let sealed = state.writer.segment();
        let next = sealed + 1;

        state.writer = SegmentWriter::open(&self.dir, next)?;
        state.segments.insert(next, state.writer.size());
        METRICS.segments_rolled.inc();
        tracing::info!("binlog {} rolled to segment {}", self.dir.display(), next);

        let purged: Vec<u32> = state
            .segments
            .keys()
            .copied()
            .take_while(|&s| s.saturating_add(self.retained_segments) < next)
            .collect();
        for s in purged {
            state.segments.remove(&s);
            segment::remove_segment(&self.dir, s)?;
            METRICS.segments_purged.inc();
            tracing::info!("binlog {} purged segment {}", self.dir.display(), s);
        }
        Ok(())
    }

    /// Read up to `limit` entries starting at `segment:offset`.
    ///
    /// Waits while the cursor is at the tail of the active segment (or ahead
    /// of it). A sealed segment that has been fully read continues into the
    /// next one. Fails with `OutOfSync` when the segment has been purged and
    /// with `Shutdown` once the manager is closed.
    pub async fn tail(&self, segment: u32, offset: u64, limit: usize) -> Result<TailBatch> {
        let mut rx = self.published.subscribe();
        let mut cursor = LogPosition::new(segment, offset);

        loop {
            let step = {
                let state = self.state.lock();
                if state.closed {
                    return Err(Error::Shutdown(format!("binlog {}", self.dir.display())));
                }
                let current = state.writer.segment();
                if cursor.segment > current {
                    TailStep::Wait
                } else {
                    match state.segments.get(&cursor.segment) {
                        None => return Err(self.out_of_sync(&state, cursor.segment)),
                        Some(&size) if cursor.offset < size => TailStep::Read { end: size },
                        Some(_) if cursor.segment < current => TailStep::Next,
                        Some(_) => TailStep::Wait,
                    }
                }
            };

            match step {
                TailStep::Read { end } => {
                    let path = self.dir.join(segment::segment_file_name(cursor.segment));
                    let batch = match segment::read_entries(&path, cursor.offset, end, limit) {
                        Ok(batch) => batch,
                        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                            // purged between the state check and the read
                            let state = self.state.lock();
                            return Err(self.out_of_sync(&state, cursor.segment));
                        }
                        Err(e) => return Err(e),
                    };
                    let mut skipped = batch.skipped;
                    let mut next = LogPosition::new(cursor.segment, batch.next_offset);
                    if next == cursor {
                        if let Some(reason) = batch.undelimited {
                            // nothing after an untrusted length prefix can be
                            // framed; drop the rest of the published bytes
                            let err = Error::CorruptEntry {
                                segment: cursor.segment,
                                offset: cursor.offset,
                                reason,
                            };
                            tracing::warn!(
                                "binlog {}: {}, skipping to {}:{}",
                                self.dir.display(),
                                err,
                                cursor.segment,
                                end
                            );
                            skipped += 1;
                            next = LogPosition::new(cursor.segment, end);
                        }
                    }
                    if skipped > 0 {
                        METRICS.corrupt_entries_skipped.add(skipped);
                    }
                    return Ok(TailBatch {
                        entries: batch.entries,
                        next,
                        skipped,
                    });
                }
                TailStep::Next => {
                    cursor = LogPosition::new(cursor.segment + 1, 0);
                }
                TailStep::Wait => {
                    let waiting_for = cursor;
                    rx.wait_for(|p| p.closed || p.position > waiting_for)
                        .await
                        .map_err(|_| Error::Shutdown(format!("binlog {}", self.dir.display())))?;
                }
            }
        }
    }

    fn out_of_sync(&self, state: &LogState, segment: u32) -> Error {
        let earliest = state.segments.keys().next().copied().unwrap_or(0);
        let latest = state.writer.segment();
        Error::OutOfSync {
            segment,
            earliest,
            latest,
        }
    }

    pub fn has_segment(&self, segment: u32) -> bool {
        self.state.lock().segments.contains_key(&segment)
    }

    pub fn segment_range(&self) -> SegmentRange {
        let state = self.state.lock();
        let latest = state.writer.segment();
        SegmentRange {
            earliest: state.segments.keys().next().copied().unwrap_or(latest),
            latest,
            latest_offset: state.writer.size(),
        }
    }

    /// Current tail of the log
    pub fn position(&self) -> LogPosition {
        let state = self.state.lock();
        LogPosition::new(state.writer.segment(), state.writer.size())
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().writer.sync()
    }

    /// Fsync the active segment on `sync_interval` until cancelled.
    /// Only the `Interval` policy needs this.
    pub fn spawn_sync_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.sync_policy != LogSyncPolicy::Interval {
            return None;
        }
        let log = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(log.sync_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = log.sync() {
                            tracing::warn!("binlog {} sync failed: {}", log.dir.display(), e);
                        }
                    }
                }
            }
        }))
    }

    /// Stop accepting appends and wake every blocked tail reader
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Err(e) = state.writer.sync() {
            tracing::warn!("binlog {} final sync failed: {}", self.dir.display(), e);
        }
        let position = LogPosition::new(state.writer.segment(), state.writer.size());
        self.published.send_replace(Published {
            position,
            closed: true,
        });
        tracing::info!("binlog {} shut down at {}", self.dir.display(), position);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("dir", &self.dir)
            .field("max_segment_size", &self.max_segment_size)
            .field("retained_segments", &self.retained_segments)
            .finish()
    }
}
