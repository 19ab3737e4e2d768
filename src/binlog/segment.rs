//! Segment files
//!
//! A segment is a plain append-only file of frames named `binlog-<n>.dat`.
//! Only the newest segment of a log is ever written; older ones are sealed.

use crate::binlog::entry::{
    decode_frame, frame_payload_len, Frame, LogEntry, FRAME_HEADER_LEN, MAX_FRAME_LEN,
};
use crate::common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "binlog-";
const SEGMENT_SUFFIX: &str = ".dat";

pub fn segment_file_name(segment: u32) -> String {
    format!("{}{}{}", SEGMENT_PREFIX, segment, SEGMENT_SUFFIX)
}

/// Segment number encoded in a file name, `None` for unrelated files
pub fn parse_segment_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// All segment numbers found in `dir`, ascending
pub fn list_segments(dir: &Path) -> Result<Vec<u32>> {
    let mut segments = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        if let Some(n) = dirent.file_name().to_str().and_then(parse_segment_file_name) {
            segments.push(n);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Result of walking a whole segment file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentScan {
    pub entries: u64,
    pub corrupt: u64,
    /// End of the last complete frame
    pub valid_len: u64,
    /// Bytes after `valid_len` that do not form a complete frame
    pub torn_bytes: u64,
}

/// Walk every frame of a segment file
pub fn scan_segment(path: &Path) -> Result<SegmentScan> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut scan = SegmentScan::default();
    let mut pos = 0usize;
    while pos < data.len() {
        match decode_frame(&data[pos..]) {
            Ok(Frame::Entry { len, .. }) => {
                scan.entries += 1;
                pos += len;
            }
            Ok(Frame::Incomplete) => break,
            Err(e) => match skippable_len(&data[pos..]) {
                Some(len) => {
                    tracing::warn!("{}: bad frame at offset {}: {}", path.display(), pos, e);
                    scan.corrupt += 1;
                    pos += len;
                }
                None => break,
            },
        }
    }
    scan.valid_len = pos as u64;
    scan.torn_bytes = (data.len() - pos) as u64;
    Ok(scan)
}

/// Length of a complete but undecodable frame, so a reader can step over it
fn skippable_len(buf: &[u8]) -> Option<usize> {
    let len = FRAME_HEADER_LEN + frame_payload_len(buf)? as usize;
    if len <= buf.len() {
        Some(len)
    } else {
        None
    }
}

/// Entries read from one segment
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub entries: Vec<LogEntry>,
    pub next_offset: u64,
    /// Frames dropped for failing decode or CRC
    pub skipped: u64,
    /// Why the frame at `next_offset` could not be delimited, if reading
    /// stopped there
    pub undelimited: Option<String>,
}

/// Read up to `limit` entries in `[offset, end)`.
///
/// `end` must be a frame boundary the writer has already published. Corrupt
/// frames are skipped and counted rather than failing the read. A frame whose
/// length prefix cannot be trusted stops the read at that frame and is
/// reported in `undelimited`.
pub fn read_entries(path: &Path, offset: u64, end: u64, limit: usize) -> Result<ReadBatch> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file.take(end.saturating_sub(offset)));

    let mut batch = ReadBatch {
        next_offset: offset,
        ..Default::default()
    };
    let mut header = [0u8; FRAME_HEADER_LEN];

    while batch.entries.len() < limit && batch.next_offset < end {
        if let Err(e) = reader.read_exact(&mut header) {
            batch.undelimited = Some(format!("short frame header: {}", e));
            break;
        }
        let payload_len = u32::from_le_bytes(header);
        if payload_len > MAX_FRAME_LEN {
            batch.undelimited = Some(format!("frame length {} exceeds limit", payload_len));
            break;
        }
        let frame_len = FRAME_HEADER_LEN + payload_len as usize;
        if batch.next_offset + frame_len as u64 > end {
            batch.undelimited = Some(format!(
                "frame of {} bytes runs past offset {}",
                frame_len, end
            ));
            break;
        }
        let mut frame = vec![0u8; frame_len];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&header);
        if let Err(e) = reader.read_exact(&mut frame[FRAME_HEADER_LEN..]) {
            batch.undelimited = Some(format!("short frame: {}", e));
            break;
        }

        match decode_frame(&frame) {
            Ok(Frame::Entry { entry, .. }) => batch.entries.push(entry),
            Ok(Frame::Incomplete) => {
                batch.undelimited = Some("incomplete frame".into());
                break;
            }
            Err(e) => {
                tracing::warn!(
                    "{}: skipping corrupt entry at offset {}: {}",
                    path.display(),
                    batch.next_offset,
                    e
                );
                batch.skipped += 1;
            }
        }
        batch.next_offset += frame.len() as u64;
    }

    Ok(batch)
}

/// Writer for the active segment
pub struct SegmentWriter {
    segment: u32,
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl SegmentWriter {
    /// Open or create the segment, truncating a torn trailing frame left by a crash
    pub fn open(dir: &Path, segment: u32) -> Result<Self> {
        let path = dir.join(segment_file_name(segment));

        let size = if path.exists() {
            let scan = scan_segment(&path)?;
            if scan.torn_bytes > 0 {
                tracing::warn!(
                    "{}: truncating {} torn bytes at offset {}",
                    path.display(),
                    scan.torn_bytes,
                    scan.valid_len
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            scan.valid_len
        } else {
            0
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            segment,
            path,
            writer: BufWriter::new(file),
            size,
        })
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one frame and flush it to the OS so readers can see it
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        self.size += frame.len() as u64;
        Ok(self.size)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("segment", &self.segment)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

/// Remove a purged segment file; a file that is already gone is fine
pub fn remove_segment(dir: &Path, segment: u32) -> Result<()> {
    match std::fs::remove_file(dir.join(segment_file_name(segment))) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(i: u32) -> LogEntry {
        LogEntry::put(i as u64, i as u64, 0, format!("k{}", i).into_bytes(), vec![7; 16])
    }

    #[test]
    fn test_file_names() {
        assert_eq!(segment_file_name(12), "binlog-12.dat");
        assert_eq!(parse_segment_file_name("binlog-12.dat"), Some(12));
        assert_eq!(parse_segment_file_name("binlog-x.dat"), None);
        assert_eq!(parse_segment_file_name("cursor.db"), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 0).unwrap();
        for i in 0..5 {
            writer.append(&entry(i).encode_frame()).unwrap();
        }
        let end = writer.size();

        let batch = read_entries(writer.path(), 0, end, 3).unwrap();
        assert_eq!(batch.entries.len(), 3);
        assert_eq!(batch.entries[2], entry(2));

        let rest = read_entries(writer.path(), batch.next_offset, end, 100).unwrap();
        assert_eq!(rest.entries.len(), 2);
        assert_eq!(rest.next_offset, end);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![0]);
    }

    #[test]
    fn test_open_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let good_len = {
            let mut writer = SegmentWriter::open(dir.path(), 3).unwrap();
            writer.append(&entry(1).encode_frame()).unwrap();
            let good_len = writer.size();
            let frame = entry(2).encode_frame();
            writer.append(&frame[..frame.len() / 2]).unwrap();
            good_len
        };

        let writer = SegmentWriter::open(dir.path(), 3).unwrap();
        assert_eq!(writer.size(), good_len);
        let scan = scan_segment(writer.path()).unwrap();
        assert_eq!(scan.entries, 1);
        assert_eq!(scan.torn_bytes, 0);
    }

    #[test]
    fn test_read_skips_corrupt_entry() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 0).unwrap();
        writer.append(&entry(1).encode_frame()).unwrap();
        let mut bad = entry(2);
        bad.crc32 = bad.crc32.wrapping_add(1);
        writer.append(&bad.encode_frame()).unwrap();
        writer.append(&entry(3).encode_frame()).unwrap();

        let batch = read_entries(writer.path(), 0, writer.size(), 10).unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.next_offset, writer.size());

        let scan = scan_segment(writer.path()).unwrap();
        assert_eq!(scan.entries, 2);
        assert_eq!(scan.corrupt, 1);
    }

    #[test]
    fn test_read_stops_at_undelimited_frame() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 0).unwrap();
        writer.append(&entry(1).encode_frame()).unwrap();
        let bad_at = writer.size();
        let mut frame = entry(2).encode_frame();
        frame[..FRAME_HEADER_LEN].copy_from_slice(&u32::MAX.to_le_bytes());
        writer.append(&frame).unwrap();

        let batch = read_entries(writer.path(), 0, writer.size(), 10).unwrap();
        assert_eq!(batch.entries, vec![entry(1)]);
        assert_eq!(batch.next_offset, bad_at);
        assert!(batch.undelimited.is_some());

        let stuck = read_entries(writer.path(), bad_at, writer.size(), 10).unwrap();
        assert!(stuck.entries.is_empty());
        assert_eq!(stuck.next_offset, bad_at);
        assert!(stuck.undelimited.unwrap().contains("exceeds limit"));
    }
}
