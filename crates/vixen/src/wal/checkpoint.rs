//! Checkpoint builder: compacts a contiguous prefix of segments.
//!
//! A checkpoint is a directory `checkpoint.NNNNNNNN` inside the WAL
//! directory, holding segment-formatted files with only the records still
//! needed for replay: series that are live (or must be kept so older sample
//! records stay resolvable) and samples at or after the truncation
//! timestamp. The directory is staged under a `.tmp` suffix and published
//! with an atomic rename.

use super::{Wal, WalReader};
use crate::error::{Result, WalError};
use crate::record::{self, RecordType, RefExemplar, RefSample, RefSeries};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHECKPOINT_PREFIX: &str = "checkpoint.";

/// Counts of records kept and dropped while building a checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckpointStats {
    /// Series entries retained.
    pub series_kept: usize,
    /// Series entries discarded.
    pub series_dropped: usize,
    /// Samples retained.
    pub samples_kept: usize,
    /// Samples discarded.
    pub samples_dropped: usize,
    /// Exemplars retained.
    pub exemplars_kept: usize,
    /// Exemplars discarded.
    pub exemplars_dropped: usize,
}

/// Builds a checkpoint covering segments `[from, to]` of the log in `dir`.
///
/// The records of the most recent existing checkpoint are folded in first,
/// so the result represents the full compaction up to and including
/// segment `to`. Series entries survive when `keep(ref)` is true; samples
/// when `keep(ref)` holds and their timestamp is at or after `mint`;
/// exemplars when their timestamp is at or after `mint`. Tombstones are
/// dropped.
pub fn checkpoint(
    dir: &Path,
    segment_size: usize,
    from: u64,
    to: u64,
    keep: impl Fn(u64) -> bool,
    mint: i64,
) -> Result<CheckpointStats> {
    let cp_dir = checkpoint_dir(dir, to);
    let tmp_dir = dir.join(format!("{}{:08}.tmp", CHECKPOINT_PREFIX, to));
    if tmp_dir.exists() {
        // Leftover from a crashed attempt.
        fs::remove_dir_all(&tmp_dir)?;
    }

    let mut stats = CheckpointStats::default();
    let cp = Wal::with_segment_size(&tmp_dir, segment_size)?;

    let mut readers = Vec::new();
    if let Some((prev_dir, prev_index)) = last_checkpoint(dir)? {
        if from > prev_index + 1 {
            warn!(
                from,
                prev_index, "unexpected gap between checkpoint and segment range"
            );
        }
        readers.push(WalReader::open(&prev_dir, 0)?);
    }
    readers.push(WalReader::open_range(dir, from, to)?);

    let mut rec = Vec::new();
    let mut enc = Vec::new();
    let mut series: Vec<RefSeries> = Vec::new();
    let mut samples: Vec<RefSample> = Vec::new();
    let mut exemplars: Vec<RefExemplar> = Vec::new();

    for mut reader in readers {
        filter_records(
            &cp,
            &mut reader,
            &keep,
            mint,
            &mut stats,
            &mut rec,
            &mut enc,
            &mut series,
            &mut samples,
            &mut exemplars,
        )?;
    }

    cp.close()?;
    drop(cp);

    fs::rename(&tmp_dir, &cp_dir)?;
    // Make the rename durable.
    File::open(dir)?.sync_all()?;

    debug!(from, to, ?stats, "checkpoint written");
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn filter_records(
    cp: &Wal,
    reader: &mut WalReader,
    keep: &impl Fn(u64) -> bool,
    mint: i64,
    stats: &mut CheckpointStats,
    rec: &mut Vec<u8>,
    enc: &mut Vec<u8>,
    series: &mut Vec<RefSeries>,
    samples: &mut Vec<RefSample>,
    exemplars: &mut Vec<RefExemplar>,
) -> Result<()> {
    while reader.next_record(rec)? {
        match record::record_type(rec) {
            RecordType::Series => {
                record::decode_series(rec, series)
                    .map_err(|e| decode_corruption(reader, "series", e))?;
                let before = series.len();
                series.retain(|s| keep(s.ref_id));
                stats.series_kept += series.len();
                stats.series_dropped += before - series.len();
                if !series.is_empty() {
                    record::encode_series(series, enc);
                    cp.log(enc)?;
                }
            }
            RecordType::Samples => {
                record::decode_samples(rec, samples)
                    .map_err(|e| decode_corruption(reader, "samples", e))?;
                let before = samples.len();
                samples.retain(|s| keep(s.ref_id) && s.t >= mint);
                stats.samples_kept += samples.len();
                stats.samples_dropped += before - samples.len();
                if !samples.is_empty() {
                    record::encode_samples(samples, enc);
                    cp.log(enc)?;
                }
            }
            RecordType::Exemplars => {
                record::decode_exemplars(rec, exemplars)
                    .map_err(|e| decode_corruption(reader, "exemplars", e))?;
                let before = exemplars.len();
                exemplars.retain(|e| e.t >= mint);
                stats.exemplars_kept += exemplars.len();
                stats.exemplars_dropped += before - exemplars.len();
                if !exemplars.is_empty() {
                    record::encode_exemplars(exemplars, enc);
                    cp.log(enc)?;
                }
            }
            RecordType::Tombstones => continue,
            RecordType::Unknown => {
                return Err(WalError::Corruption {
                    segment: reader.segment(),
                    offset: reader.offset(),
                    cause: "invalid record type".to_string(),
                })
            }
        }
    }
    Ok(())
}

/// Returns the newest checkpoint directory in `dir` and the segment number
/// it covers, if any checkpoint exists.
pub fn last_checkpoint(dir: &Path) -> Result<Option<(PathBuf, u64)>> {
    let mut newest: Option<(PathBuf, u64)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(index) = parse_checkpoint_name(&path) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(_, max)| index > *max) {
            newest = Some((path, index));
        }
    }
    Ok(newest)
}

/// Deletes all checkpoint directories covering segments below `before`.
pub fn delete_checkpoints(dir: &Path, before: u64) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(index) = parse_checkpoint_name(&path) {
            if index < before {
                fs::remove_dir_all(&path)?;
                debug!(index, "removed old checkpoint");
            }
        }
    }
    Ok(())
}

/// Returns the checkpoint directory path for segment `n`.
pub fn checkpoint_dir(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{}{:08}", CHECKPOINT_PREFIX, n))
}

fn parse_checkpoint_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(CHECKPOINT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

fn decode_corruption(reader: &WalReader, what: &str, err: record::DecodeError) -> WalError {
    WalError::Corruption {
        segment: reader.segment(),
        offset: reader.offset(),
        cause: format!("decode {what}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use tempfile::TempDir;

    fn series_rec(refs: &[u64]) -> Vec<u8> {
        let series: Vec<RefSeries> = refs
            .iter()
            .map(|&r| RefSeries {
                ref_id: r,
                labels: Labels::from_pairs([("series", format!("{r}"))]),
            })
            .collect();
        let mut buf = Vec::new();
        record::encode_series(&series, &mut buf);
        buf
    }

    fn samples_rec(samples: &[(u64, i64)]) -> Vec<u8> {
        let samples: Vec<RefSample> = samples
            .iter()
            .map(|&(r, t)| RefSample {
                ref_id: r,
                t,
                v: 1.0,
            })
            .collect();
        let mut buf = Vec::new();
        record::encode_samples(&samples, &mut buf);
        buf
    }

    #[test]
    fn test_checkpoint_filters_and_publishes() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(temp_dir.path()).unwrap();
        wal.log(&series_rec(&[1, 2, 3])).unwrap();
        wal.log(&samples_rec(&[(1, 100), (2, 500), (3, 900)])).unwrap();
        wal.next_segment().unwrap();
        wal.close().unwrap();

        let stats = checkpoint(temp_dir.path(), wal.segment_size(), 0, 0, |r| r != 2, 300)
            .unwrap();
        assert_eq!(stats.series_kept, 2);
        assert_eq!(stats.series_dropped, 1);
        assert_eq!(stats.samples_kept, 1); // only (3, 900): ref kept and t >= 300
        assert_eq!(stats.samples_dropped, 2);

        let (cp_path, index) = last_checkpoint(temp_dir.path()).unwrap().unwrap();
        assert_eq!(index, 0);

        let mut reader = WalReader::open(&cp_path, 0).unwrap();
        let mut rec = Vec::new();
        let mut series = Vec::new();
        let mut samples = Vec::new();
        let mut seen_series = Vec::new();
        let mut seen_samples = Vec::new();
        while reader.next_record(&mut rec).unwrap() {
            match record::record_type(&rec) {
                RecordType::Series => {
                    record::decode_series(&rec, &mut series).unwrap();
                    seen_series.extend(series.iter().map(|s| s.ref_id));
                }
                RecordType::Samples => {
                    record::decode_samples(&rec, &mut samples).unwrap();
                    seen_samples.extend(samples.iter().map(|s| (s.ref_id, s.t)));
                }
                other => panic!("unexpected record type {other:?}"),
            }
        }
        assert_eq!(seen_series, vec![1, 3]);
        assert_eq!(seen_samples, vec![(3, 900)]);
    }

    #[test]
    fn test_checkpoint_folds_in_previous_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let wal = Wal::open(temp_dir.path()).unwrap();
        wal.log(&series_rec(&[1])).unwrap();
        wal.next_segment().unwrap();
        wal.log(&samples_rec(&[(1, 500)])).unwrap();
        wal.next_segment().unwrap();
        wal.close().unwrap();

        checkpoint(temp_dir.path(), wal.segment_size(), 0, 0, |_| true, 0).unwrap();
        delete_checkpoints(temp_dir.path(), 0).unwrap();

        // The second checkpoint covers segment 1 only, but must carry the
        // series record from checkpoint.00000000 forward.
        checkpoint(temp_dir.path(), wal.segment_size(), 1, 1, |_| true, 0).unwrap();
        delete_checkpoints(temp_dir.path(), 1).unwrap();

        let (cp_path, index) = last_checkpoint(temp_dir.path()).unwrap().unwrap();
        assert_eq!(index, 1);

        let mut reader = WalReader::open(&cp_path, 0).unwrap();
        let mut rec = Vec::new();
        let mut series = Vec::new();
        let mut found_series = false;
        let mut found_sample = false;
        while reader.next_record(&mut rec).unwrap() {
            match record::record_type(&rec) {
                RecordType::Series => {
                    record::decode_series(&rec, &mut series).unwrap();
                    assert_eq!(series[0].ref_id, 1);
                    found_series = true;
                }
                RecordType::Samples => found_sample = true,
                other => panic!("unexpected record type {other:?}"),
            }
        }
        assert!(found_series, "series record must be carried forward");
        assert!(found_sample);
    }

    #[test]
    fn test_last_checkpoint_ignores_tmp() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("checkpoint.00000002")).unwrap();
        fs::create_dir(temp_dir.path().join("checkpoint.00000005.tmp")).unwrap();

        let (_, index) = last_checkpoint(temp_dir.path()).unwrap().unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn test_delete_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        for i in [1u64, 3, 5] {
            fs::create_dir(checkpoint_dir(temp_dir.path(), i)).unwrap();
        }
        delete_checkpoints(temp_dir.path(), 5).unwrap();

        let (_, index) = last_checkpoint(temp_dir.path()).unwrap().unwrap();
        assert_eq!(index, 5);
        assert!(!checkpoint_dir(temp_dir.path(), 1).exists());
        assert!(!checkpoint_dir(temp_dir.path(), 3).exists());
    }
}
