//! Append-only segment files for received logical decoding output.
//!
//! Each segment is JSON-lines, one record per decoded plugin message, and
//! is named by the LSN of its first record (`<16-hex>.jsonl`). A segment
//! under construction carries a `.partial` suffix and becomes visible
//! through an fsync + rename; anything still `.partial` after a crash is
//! discarded, because the stream can always be re-received from the last
//! durable position.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

const SEGMENT_SUFFIX: &str = ".jsonl";
const PARTIAL_SUFFIX: &str = ".jsonl.partial";

/// One received plugin message with the WAL position it was framed at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecord {
    pub lsn: Lsn,
    pub data: String,
}

/// Rotating writer owned by the receiver; nothing else writes segments.
pub struct SegmentWriter {
    dir: PathBuf,
    segment_size: u64,
    current: Option<OpenSegment>,
}

struct OpenSegment {
    start_lsn: Lsn,
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl SegmentWriter {
    pub fn open(dir: &Path, segment_size: u64) -> Result<SegmentWriter> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        // Stale partial segments are re-receivable noise.
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(PARTIAL_SUFFIX))
                .unwrap_or(false)
            {
                tracing::warn!("discarding partial segment {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(SegmentWriter {
            dir: dir.to_path_buf(),
            segment_size: segment_size.max(4096),
            current: None,
        })
    }

    /// Append one record, opening a segment named by this record's LSN if
    /// none is open, and rotating afterwards once the size threshold is
    /// crossed.
    pub fn append(&mut self, record: &SegmentRecord) -> Result<()> {
        if self.current.is_none() {
            let path = self
                .dir
                .join(format!("{}{PARTIAL_SUFFIX}", record.lsn.filename()));
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            self.current = Some(OpenSegment {
                start_lsn: record.lsn,
                path,
                writer: BufWriter::new(file),
                bytes: 0,
            });
        }

        let segment = self.current.as_mut().expect("segment open");
        let line = serde_json::to_string(record)?;
        segment.writer.write_all(line.as_bytes())?;
        segment.writer.write_all(b"\n")?;
        segment.bytes += line.len() as u64 + 1;

        if segment.bytes >= self.segment_size {
            self.rotate()?;
        }
        Ok(())
    }

    /// Durably finalize the open segment: flush, fsync, rename.
    pub fn rotate(&mut self) -> Result<()> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        segment.writer.flush()?;
        segment.writer.get_ref().sync_all()?;
        let final_path = self
            .dir
            .join(format!("{}{SEGMENT_SUFFIX}", segment.start_lsn.filename()));
        fs::rename(&segment.path, &final_path)
            .with_context(|| format!("failed to finalize {}", final_path.display()))?;
        tracing::debug!(
            "finalized segment {} ({} bytes)",
            final_path.display(),
            segment.bytes
        );
        Ok(())
    }

    /// LSN of the last fully durable byte: everything in finalized
    /// segments, nothing in the open one.
    pub fn flushed_lsn(&self, fallback: Lsn) -> Lsn {
        match &self.current {
            Some(open) => open.start_lsn,
            None => fallback,
        }
    }
}

/// Finalized segments in LSN order.
pub fn list_segments(dir: &Path) -> Result<Vec<(Lsn, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) else {
            continue;
        };
        match Lsn::from_filename(stem) {
            Ok(lsn) => segments.push((lsn, path)),
            Err(_) => tracing::warn!("ignoring oddly named segment {name}"),
        }
    }
    segments.sort_by_key(|(lsn, _)| *lsn);
    Ok(segments)
}

/// Read every record of one segment.
pub fn read_segment(path: &Path) -> Result<Vec<SegmentRecord>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record: SegmentRecord = serde_json::from_str(&line).with_context(|| {
            format!("corrupt segment record at {}:{}", path.display(), lineno + 1)
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Delete segments wholly below the apply frontier. A segment is safe to
/// drop when the next segment starts at or below the frontier, meaning
/// every record it holds has been superseded.
pub fn truncate_below(dir: &Path, frontier: Lsn) -> Result<usize> {
    let segments = list_segments(dir)?;
    let mut removed = 0;
    for pair in segments.windows(2) {
        let (_, ref path) = pair[0];
        let (next_start, _) = pair[1];
        if next_start <= frontier {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lsn: u64, data: &str) -> SegmentRecord {
        SegmentRecord {
            lsn: Lsn(lsn),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_append_rotate_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 4096).unwrap();

        writer.append(&record(0x1000, "first")).unwrap();
        writer.append(&record(0x1100, "second")).unwrap();
        writer.rotate().unwrap();
        writer.append(&record(0x2000, "third")).unwrap();
        writer.rotate().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].0, Lsn(0x1000));
        assert_eq!(segments[1].0, Lsn(0x2000));

        let records = read_segment(&segments[0].1).unwrap();
        assert_eq!(records, vec![record(0x1000, "first"), record(0x1100, "second")]);
    }

    #[test]
    fn test_size_rotation() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold: every record should land in its own segment.
        let mut writer = SegmentWriter::open(dir.path(), 4096).unwrap();
        let big = "x".repeat(5000);
        writer.append(&record(0x1000, &big)).unwrap();
        writer.append(&record(0x2000, &big)).unwrap();
        writer.rotate().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_partial_segments_are_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = SegmentWriter::open(dir.path(), 1 << 20).unwrap();
            writer.append(&record(0x1000, "finalized")).unwrap();
            writer.rotate().unwrap();
            // Left open: simulates a crash before rotation.
            writer.append(&record(0x2000, "lost")).unwrap();
        }
        assert!(fs::read_dir(dir.path()).unwrap().count() >= 2);

        let _writer = SegmentWriter::open(dir.path(), 1 << 20).unwrap();
        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, Lsn(0x1000));
        // The partial file is gone.
        let leftover: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(PARTIAL_SUFFIX))
            .collect();
        assert!(leftover.is_empty());
    }

    #[test]
    fn test_truncate_below_keeps_frontier_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), 4096).unwrap();
        for start in [0x1000u64, 0x2000, 0x3000] {
            writer.append(&record(start, "data")).unwrap();
            writer.rotate().unwrap();
        }

        // Frontier inside the second segment: only the first may go.
        let removed = truncate_below(dir.path(), Lsn(0x2500)).unwrap();
        assert_eq!(removed, 1);
        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments[0].0, Lsn(0x2000));

        // The newest segment is never deleted.
        let removed = truncate_below(dir.path(), Lsn(0xFFFF_FFFF)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(list_segments(dir.path()).unwrap().len(), 1);
    }
}
