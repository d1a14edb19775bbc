//! Sequential record reader over a range of WAL segments.

use super::{
    list_segments, CASTAGNOLI, PAGE_SIZE, REC_FIRST, REC_FULL, REC_LAST, REC_MIDDLE,
    REC_PAGE_TERM,
};
use crate::error::{Result, WalError};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Iterates records across WAL segments in order.
///
/// Framing violations, checksum mismatches and torn trailing records are
/// reported as [`WalError::Corruption`] carrying the segment number and the
/// byte offset of the record's first fragment. The same position is exposed
/// through [`WalReader::segment`] and [`WalReader::offset`] for the record
/// most recently returned, which is what [`super::Wal::repair`] uses to cut
/// the log at the last good record boundary.
pub struct WalReader {
    segments: Vec<(u64, PathBuf)>,
    next: usize,
    file: Option<BufReader<File>>,
    segment: u64,
    total: u64,
    rec_start: u64,
    scratch: Vec<u8>,
}

impl WalReader {
    /// Opens a reader over all segments in `dir` numbered `start` or higher.
    pub fn open(dir: &Path, start: u64) -> Result<Self> {
        Self::open_range(dir, start, u64::MAX)
    }

    /// Opens a reader over segments numbered within `[start, end]`.
    pub fn open_range(dir: &Path, start: u64, end: u64) -> Result<Self> {
        let segments = list_segments(dir)?
            .into_iter()
            .filter(|(index, _)| *index >= start && *index <= end)
            .collect();
        Ok(Self::from_segments(segments))
    }

    /// Reader over a single file standing in for segment `number`.
    pub(crate) fn single_file(path: &Path, number: u64) -> Self {
        Self::from_segments(vec![(number, path.to_path_buf())])
    }

    fn from_segments(segments: Vec<(u64, PathBuf)>) -> Self {
        Self {
            segments,
            next: 0,
            file: None,
            segment: 0,
            total: 0,
            rec_start: 0,
            scratch: vec![0u8; PAGE_SIZE],
        }
    }

    /// Segment number of the most recently returned or failed record.
    pub fn segment(&self) -> u64 {
        self.segment
    }

    /// Byte offset of the first fragment of the most recently returned or
    /// failed record within its segment.
    pub fn offset(&self) -> u64 {
        self.rec_start
    }

    /// Reads the next record into `rec`, replacing its contents.
    ///
    /// Returns `Ok(false)` at the clean end of the segment range.
    pub fn next_record(&mut self, rec: &mut Vec<u8>) -> Result<bool> {
        rec.clear();
        loop {
            if self.file.is_none() && !self.advance_segment()? {
                return Ok(false);
            }
            if self.read_record(rec)? {
                return Ok(true);
            }
            // Clean end of this segment; move on to the next one.
            self.file = None;
        }
    }

    fn advance_segment(&mut self) -> Result<bool> {
        let Some((index, path)) = self.segments.get(self.next) else {
            return Ok(false);
        };
        self.file = Some(BufReader::new(File::open(path)?));
        self.segment = *index;
        self.total = 0;
        self.rec_start = 0;
        self.next += 1;
        Ok(true)
    }

    /// Reads one record from the current segment. Returns `Ok(false)` on a
    /// clean end-of-segment.
    fn read_record(&mut self, rec: &mut Vec<u8>) -> Result<bool> {
        let mut fragments = 0usize;
        loop {
            if fragments == 0 {
                self.rec_start = self.total;
            }

            let mut typ = [0u8; 1];
            match self.read_exact(&mut typ) {
                ReadOutcome::Done => {}
                ReadOutcome::Eof => {
                    if fragments == 0 {
                        return Ok(false);
                    }
                    return Err(self.corruption("last record is torn"));
                }
                ReadOutcome::Err(err) => return Err(err.into()),
            }
            self.total += 1;

            if typ[0] == REC_PAGE_TERM {
                // The rest of the page is zero padding.
                let pad = PAGE_SIZE as u64 - (self.total % PAGE_SIZE as u64);
                if pad == PAGE_SIZE as u64 {
                    // The zero byte was the last byte of the page.
                    continue;
                }
                let buf = &mut self.scratch[..pad as usize];
                match read_full(self.file.as_mut(), buf) {
                    ReadOutcome::Done => {}
                    ReadOutcome::Eof => return Err(self.corruption("torn page padding")),
                    ReadOutcome::Err(err) => return Err(err.into()),
                }
                self.total += pad;
                if buf.iter().any(|&b| b != 0) {
                    return Err(self.corruption("unexpected non-zero byte in padded page"));
                }
                continue;
            }

            if typ[0] & !0b111 != 0 {
                // Compressed fragments are never written by this store.
                return Err(self.corruption(format!(
                    "unsupported record fragment flags {:#04x}",
                    typ[0]
                )));
            }
            let frag_type = typ[0] & 0b111;
            if frag_type > REC_LAST {
                return Err(self.corruption(format!("invalid fragment type {frag_type}")));
            }

            let mut hdr = [0u8; 6];
            match self.read_exact(&mut hdr) {
                ReadOutcome::Done => {}
                ReadOutcome::Eof => return Err(self.corruption("last record is torn")),
                ReadOutcome::Err(err) => return Err(err.into()),
            }
            self.total += 6;

            let len = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
            let crc = u32::from_be_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]);
            if len > PAGE_SIZE - super::RECORD_HEADER_SIZE {
                return Err(self.corruption(format!("invalid fragment size {len}")));
            }

            let buf = &mut self.scratch[..len];
            match read_full(self.file.as_mut(), buf) {
                ReadOutcome::Done => {}
                ReadOutcome::Eof => return Err(self.corruption("last record is torn")),
                ReadOutcome::Err(err) => return Err(err.into()),
            }
            self.total += len as u64;

            if CASTAGNOLI.checksum(buf) != crc {
                return Err(self.corruption("checksum mismatch"));
            }

            let in_order = match frag_type {
                REC_FULL | REC_FIRST => fragments == 0,
                REC_MIDDLE | REC_LAST => fragments > 0,
                _ => false,
            };
            if !in_order {
                return Err(self.corruption(format!(
                    "out-of-order fragment type {frag_type}"
                )));
            }

            rec.extend_from_slice(buf);
            if frag_type == REC_FULL || frag_type == REC_LAST {
                return Ok(true);
            }
            fragments += 1;
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ReadOutcome {
        read_full(self.file.as_mut(), buf)
    }

    fn corruption(&self, cause: impl Into<String>) -> WalError {
        WalError::Corruption {
            segment: self.segment,
            offset: self.rec_start,
            cause: cause.into(),
        }
    }
}

enum ReadOutcome {
    Done,
    Eof,
    Err(std::io::Error),
}

fn read_full(file: Option<&mut BufReader<File>>, buf: &mut [u8]) -> ReadOutcome {
    let Some(file) = file else {
        return ReadOutcome::Eof;
    };
    match file.read_exact(buf) {
        Ok(()) => ReadOutcome::Done,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => ReadOutcome::Eof,
        Err(err) => ReadOutcome::Err(err),
    }
}
