//! Append-only segmented log.
//!
//! The log is a directory of fixed-maximum-size segment files named
//! `00000000`, `00000001`, ... Records are framed into 32 KiB pages; a
//! record that does not fit in the current page is split into fragments,
//! each carrying a 7-byte header:
//!
//! ```text
//! type(1) | length(2, BE) | crc32c(4, BE) | payload
//! ```
//!
//! Fragment types: 0 = page padding (rest of page is zeros), 1 = full,
//! 2 = first, 3 = middle, 4 = last. The layout is shared with the upstream
//! time series journal format, so segments written here remain readable by
//! other tools in the ecosystem.
//!
//! Durability: a successful [`Wal::log`] call leaves the record in the OS
//! page cache. Segments are fsynced when rolled and on [`Wal::close`].
//!
//! # Lifecycle
//!
//! A segment is active while it is being appended to, immutable once the
//! writer rolls past it, and deleted from disk by [`Wal::truncate`] after a
//! checkpoint supersedes it.

pub mod checkpoint;
mod reader;

pub use reader::WalReader;

use crate::error::{Result, WalError};
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default maximum segment size (128 MiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

/// Size of a write page. Fragment headers never span a page boundary.
pub(crate) const PAGE_SIZE: usize = 32 * 1024;

/// Size of a fragment header: type byte, u16 length, u32 checksum.
pub(crate) const RECORD_HEADER_SIZE: usize = 7;

pub(crate) const REC_PAGE_TERM: u8 = 0;
pub(crate) const REC_FULL: u8 = 1;
pub(crate) const REC_FIRST: u8 = 2;
pub(crate) const REC_MIDDLE: u8 = 3;
pub(crate) const REC_LAST: u8 = 4;

/// Fragment checksums use CRC-32C (Castagnoli), per the upstream format.
pub(crate) const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A write page being assembled in memory.
struct Page {
    buf: Box<[u8; PAGE_SIZE]>,
    alloc: usize,
    flushed: usize,
}

impl Page {
    fn new() -> Self {
        Self {
            buf: Box::new([0u8; PAGE_SIZE]),
            alloc: 0,
            flushed: 0,
        }
    }

    fn remaining(&self) -> usize {
        PAGE_SIZE - self.alloc
    }

    /// A page is full once it cannot fit another fragment header.
    fn full(&self) -> bool {
        self.remaining() < RECORD_HEADER_SIZE
    }

    fn reset(&mut self) {
        self.buf.fill(0);
        self.alloc = 0;
        self.flushed = 0;
    }
}

struct WalInner {
    file: File,
    segment: u64,
    page: Page,
    done_pages: usize,
}

/// Append-only segmented log writer.
///
/// Appends are serialized internally; `&self` methods are safe to call from
/// multiple threads.
pub struct Wal {
    dir: PathBuf,
    segment_size: usize,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens the log in `dir` with the default segment size.
    ///
    /// The directory is created if missing. Writing always starts on a
    /// fresh segment after the highest existing one; a partially-written
    /// tail segment is left in place for the reader, which hands it to
    /// [`Wal::repair`] when it turns out to be torn.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_segment_size(dir, DEFAULT_SEGMENT_SIZE)
    }

    /// Opens the log in `dir` with a custom maximum segment size.
    ///
    /// `segment_size` is rounded down to whole pages; sizes below one page
    /// are raised to a single page.
    pub fn with_segment_size(dir: impl AsRef<Path>, segment_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let next = match Self::segments(&dir)? {
            Some((_, last)) => last + 1,
            None => 0,
        };
        let file = create_segment_file(&dir, next)?;

        Ok(Self {
            dir,
            segment_size: segment_size.max(PAGE_SIZE),
            inner: Mutex::new(WalInner {
                file,
                segment: next,
                page: Page::new(),
                done_pages: 0,
            }),
        })
    }

    /// Returns the log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the configured maximum segment size.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Returns the lowest and highest segment numbers present in `dir`,
    /// or `None` when the directory holds no segments.
    pub fn segments(dir: &Path) -> Result<Option<(u64, u64)>> {
        let list = list_segments(dir)?;
        match (list.first(), list.last()) {
            (Some(&(first, _)), Some(&(last, _))) => Ok(Some((first, last))),
            _ => Ok(None),
        }
    }

    /// Appends one record to the log.
    ///
    /// On success the record has been handed to the OS page cache; it
    /// survives a process crash but not necessarily power loss.
    pub fn log(&self, rec: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        self.log_locked(&mut inner, rec)
    }

    /// Forces a roll to a new segment, returning its number.
    pub fn next_segment(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.roll_locked(&mut inner)
    }

    /// Removes all segments with a number lower than `n`.
    pub fn truncate(&self, n: u64) -> Result<()> {
        for (index, path) in list_segments(&self.dir)? {
            if index >= n {
                break;
            }
            fs::remove_file(&path)?;
            debug!(segment = index, "removed WAL segment");
        }
        Ok(())
    }

    /// Repairs a torn or corrupt tail reported by a reader.
    ///
    /// All segments after the corrupt one are deleted, the corrupt segment
    /// is rewritten keeping only the records that start before `offset`,
    /// and writing continues on a fresh segment.
    pub fn repair(&self, segment: u64, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        warn!(segment, offset, "repairing WAL, deleting segments past the corruption");

        // Records never reach backwards into earlier segments, so everything
        // after the corrupt segment is unusable.
        for (index, path) in list_segments(&self.dir)? {
            if index > segment {
                fs::remove_file(&path)?;
            }
        }

        let orig = segment_path(&self.dir, segment);
        let tmp = self.dir.join(format!("{:08}.repair", segment));
        fs::rename(&orig, &tmp)?;

        // A clean segment under the same number becomes the write target
        // while the good prefix is copied back.
        inner.file = create_segment_file(&self.dir, segment)?;
        inner.segment = segment;
        inner.done_pages = 0;
        inner.page.reset();

        let mut reader = WalReader::single_file(&tmp, segment);
        let mut rec = Vec::new();
        loop {
            match reader.next_record(&mut rec) {
                Ok(true) => {
                    if reader.offset() >= offset {
                        break;
                    }
                    self.log_locked(&mut inner, &rec)?;
                }
                Ok(false) => break,
                // An error at the corruption point is expected; everything
                // before it has been copied.
                Err(_) => break,
            }
        }
        fs::remove_file(&tmp)?;

        self.roll_locked(&mut inner)?;
        Ok(())
    }

    /// Flushes the current page and fsyncs the active segment.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.page.alloc > inner.page.flushed {
            Self::flush_page(&mut inner, false)?;
        }
        inner.file.sync_all()?;
        Ok(())
    }

    fn pages_per_segment(&self) -> usize {
        (self.segment_size / PAGE_SIZE).max(1)
    }

    fn log_locked(&self, inner: &mut WalInner, rec: &[u8]) -> Result<()> {
        // A failed flush leaves the page full; retry it before appending.
        if inner.page.full() {
            Self::flush_page(inner, true)?;
        }

        // Roll early when the record cannot fit into the remaining pages of
        // the segment. Signed arithmetic: `done_pages` may already have
        // consumed the whole page budget.
        let spare_pages = self.pages_per_segment() as i64 - inner.done_pages as i64 - 1;
        let left = inner.page.remaining().saturating_sub(RECORD_HEADER_SIZE) as i64
            + spare_pages * (PAGE_SIZE - RECORD_HEADER_SIZE) as i64;
        if rec.len() as i64 > left {
            self.roll_locked(inner)?;
        }

        let mut rest = rec;
        let mut first = true;
        loop {
            let free = inner.page.remaining() - RECORD_HEADER_SIZE;
            let take = rest.len().min(free);
            let (part, tail) = rest.split_at(take);

            let typ = match (first, tail.is_empty()) {
                (true, true) => REC_FULL,
                (true, false) => REC_FIRST,
                (false, true) => REC_LAST,
                (false, false) => REC_MIDDLE,
            };

            let crc = CASTAGNOLI.checksum(part);
            let at = inner.page.alloc;
            let buf = &mut inner.page.buf[at..at + RECORD_HEADER_SIZE + part.len()];
            buf[0] = typ;
            buf[1..3].copy_from_slice(&(part.len() as u16).to_be_bytes());
            buf[3..7].copy_from_slice(&crc.to_be_bytes());
            buf[RECORD_HEADER_SIZE..].copy_from_slice(part);
            inner.page.alloc += RECORD_HEADER_SIZE + part.len();

            if inner.page.full() {
                Self::flush_page(inner, true)?;
            }

            rest = tail;
            if rest.is_empty() {
                break;
            }
            first = false;
        }

        // Hand the partial page to the OS so the record survives a crash.
        if inner.page.alloc > inner.page.flushed {
            Self::flush_page(inner, false)?;
        }
        Ok(())
    }

    fn flush_page(inner: &mut WalInner, clear: bool) -> Result<()> {
        let WalInner {
            file,
            page,
            done_pages,
            ..
        } = inner;

        if clear && page.alloc > 0 {
            // Bytes past `alloc` are zero, so padding is just claiming the
            // rest of the page.
            page.alloc = PAGE_SIZE;
        }

        file.write_all(&page.buf[page.flushed..page.alloc])?;
        page.flushed = page.alloc;

        if clear {
            page.reset();
            *done_pages += 1;
        }
        Ok(())
    }

    fn roll_locked(&self, inner: &mut WalInner) -> Result<u64> {
        if inner.page.alloc > 0 {
            Self::flush_page(inner, true)?;
        }
        inner.file.sync_all()?;

        let next = inner.segment + 1;
        inner.file = create_segment_file(&self.dir, next)?;
        inner.segment = next;
        inner.done_pages = 0;
        inner.page.reset();

        debug!(segment = next, "rolled to new WAL segment");
        Ok(next)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Best effort to push the tail page out.
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to flush WAL on drop");
        }
    }
}

/// Returns the path of segment `n` inside `dir`.
pub(crate) fn segment_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{:08}", n))
}

/// Lists segment files in `dir` sorted by number.
///
/// Non-numeric entries (checkpoint directories, repair temporaries) are
/// skipped.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(index) = name.parse::<u64>() {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

fn create_segment_file(dir: &Path, n: u64) -> Result<File> {
    let path = segment_path(dir, n);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(dir: &Path, start: u64) -> Vec<Vec<u8>> {
        let mut reader = WalReader::open(dir, start).unwrap();
        let mut out = Vec::new();
        let mut rec = Vec::new();
        while reader.next_record(&mut rec).unwrap() {
            out.push(rec.clone());
        }
        out
    }

    #[test]
    fn test_log_and_read_small_records() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(temp_dir.path()).unwrap();

        for i in 0u8..10 {
            wal.log(&[i; 16]).unwrap();
        }
        wal.close().unwrap();

        let records = read_all(temp_dir.path(), 0);
        assert_eq!(records.len(), 10);
        assert_eq!(records[3], vec![3u8; 16]);
    }

    #[test]
    fn test_record_fragments_across_pages() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::with_segment_size(temp_dir.path(), 4 * PAGE_SIZE).unwrap();

        // Three pages worth of payload forces first/middle/last fragments.
        let big: Vec<u8> = (0..(3 * PAGE_SIZE)).map(|i| (i % 251) as u8).collect();
        wal.log(&big).unwrap();
        wal.log(b"after").unwrap();
        wal.close().unwrap();

        let records = read_all(temp_dir.path(), 0);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], big);
        assert_eq!(records[1], b"after");
    }

    #[test]
    fn test_segment_roll_on_size() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::with_segment_size(temp_dir.path(), PAGE_SIZE).unwrap();

        // Each record fills most of a page, so every append rolls.
        let rec = vec![7u8; PAGE_SIZE - RECORD_HEADER_SIZE];
        for _ in 0..4 {
            wal.log(&rec).unwrap();
        }
        wal.close().unwrap();

        let (first, last) = Wal::segments(temp_dir.path()).unwrap().unwrap();
        assert_eq!(first, 0);
        assert!(last >= 3);

        let records = read_all(temp_dir.path(), 0);
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn test_open_starts_fresh_segment() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path()).unwrap();
            wal.log(b"one").unwrap();
            wal.close().unwrap();
        }
        {
            let wal = Wal::open(temp_dir.path()).unwrap();
            wal.log(b"two").unwrap();
            wal.close().unwrap();
        }

        let (first, last) = Wal::segments(temp_dir.path()).unwrap().unwrap();
        assert_eq!((first, last), (0, 1));
        let records = read_all(temp_dir.path(), 0);
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_truncate_removes_old_segments() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(temp_dir.path()).unwrap();
        wal.log(b"a").unwrap();
        wal.next_segment().unwrap();
        wal.log(b"b").unwrap();
        wal.next_segment().unwrap();
        wal.log(b"c").unwrap();
        wal.close().unwrap();

        wal.truncate(2).unwrap();
        let (first, last) = Wal::segments(temp_dir.path()).unwrap().unwrap();
        assert_eq!((first, last), (2, 2));
        assert_eq!(read_all(temp_dir.path(), 2), vec![b"c".to_vec()]);
    }

    #[test]
    fn test_torn_tail_detected_and_repaired() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path()).unwrap();
            wal.log(b"intact record").unwrap();
            wal.log(b"record that will be torn").unwrap();
            wal.close().unwrap();
        }

        // Chop the last byte off the tail segment to simulate a torn write.
        let path = segment_path(temp_dir.path(), 0);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 1).unwrap();

        let mut reader = WalReader::open(temp_dir.path(), 0).unwrap();
        let mut rec = Vec::new();
        assert!(reader.next_record(&mut rec).unwrap());
        assert_eq!(rec, b"intact record");
        let err = reader.next_record(&mut rec).unwrap_err();
        let (segment, offset) = match err {
            WalError::Corruption {
                segment, offset, ..
            } => (segment, offset),
            other => panic!("expected corruption, got {other:?}"),
        };
        assert_eq!(segment, 0);

        let wal = Wal::open(temp_dir.path()).unwrap();
        wal.repair(segment, offset).unwrap();

        let records = read_all(temp_dir.path(), 0);
        assert_eq!(records, vec![b"intact record".to_vec()]);
    }

    #[test]
    fn test_bit_flip_detected_by_checksum() {
        let temp_dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(temp_dir.path()).unwrap();
            for i in 0u8..8 {
                wal.log(&[i; 64]).unwrap();
            }
            wal.close().unwrap();
        }

        // Flip one bit near the end of the tail segment.
        let path = segment_path(temp_dir.path(), 0);
        let mut data = fs::read(&path).unwrap();
        let at = data.len() - 10;
        data[at] ^= 0x40;
        fs::write(&path, &data).unwrap();

        let mut reader = WalReader::open(temp_dir.path(), 0).unwrap();
        let mut rec = Vec::new();
        let mut good = 0;
        let err = loop {
            match reader.next_record(&mut rec) {
                Ok(true) => good += 1,
                Ok(false) => panic!("corruption was not detected"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, WalError::Corruption { .. }));
        assert!(good >= 7, "expected records before the flip, got {good}");
    }

    #[test]
    fn test_list_segments_skips_checkpoint_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(temp_dir.path()).unwrap();
        wal.log(b"x").unwrap();
        wal.close().unwrap();

        fs::create_dir(temp_dir.path().join("checkpoint.00000004")).unwrap();
        let (first, last) = Wal::segments(temp_dir.path()).unwrap().unwrap();
        assert_eq!((first, last), (0, 0));
    }
}
