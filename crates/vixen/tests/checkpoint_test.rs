//! Integration tests for truncation: checkpoint horizon arithmetic,
//! retention of deleted series records and purging of the deleted map.

use alopex_vixen::storage::wal_sub_directory;
use alopex_vixen::{Labels, Storage, StorageConfig, Wal};
use std::path::Path;
use tempfile::TempDir;

// One page per segment keeps the tests fast while forcing rolls.
const SEGMENT_SIZE: usize = 32 * 1024;

fn open(dir: &Path) -> Storage {
    let config = StorageConfig::default().with_segment_size(SEGMENT_SIZE);
    Storage::open(dir, config, None).unwrap()
}

fn filler_labels() -> Labels {
    Labels::from_pairs([("__name__", "filler"), ("job", "bulk")])
}

/// Commits bulk samples until the WAL's highest segment number reaches
/// `upto`. Timestamps continue from `t`, which is advanced in place.
fn fill_segments(storage: &Storage, wal_dir: &Path, upto: u64, t: &mut i64) {
    let labels = filler_labels();
    let mut app = storage.appender();
    let mut ref_id = 0;
    loop {
        let (_, last) = Wal::segments(wal_dir).unwrap().unwrap();
        if last >= upto {
            break;
        }
        for _ in 0..2_000 {
            *t += 1;
            ref_id = app.append(ref_id, &labels, *t, 1.0).unwrap();
        }
        app.commit().unwrap();
    }
}

#[test]
fn test_checkpoint_horizon() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(temp_dir.path());
    let wal_dir = wal_sub_directory(temp_dir.path());

    let mut t = 1_000;
    fill_segments(&storage, &wal_dir, 9, &mut t);
    assert_eq!(Wal::segments(&wal_dir).unwrap(), Some((0, 9)));

    storage.truncate(0).unwrap();

    // With segments 0..9 the active one is excluded (last = 8) and the
    // lower two thirds land in a checkpoint: up to 0 + 8*2/3 = 5.
    assert_eq!(Wal::segments(&wal_dir).unwrap(), Some((6, 10)));
    assert!(wal_dir.join("checkpoint.00000005").is_dir());
    storage.close().unwrap();

    // Replay walks the checkpoint and then segments 6..10; no sample is
    // lost across the compaction.
    let storage = open(temp_dir.path());
    let series: Vec<_> = storage.iter_series().collect();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].last_timestamp(), t);
    storage.close().unwrap();
}

#[test]
fn test_checkpoint_keeps_deleted_series_records() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(temp_dir.path());
    let wal_dir = wal_sub_directory(temp_dir.path());

    // A short-lived series whose samples will age out.
    let mut app = storage.appender();
    let ref_a = app
        .append(0, &Labels::from_pairs([("__name__", "shortlived")]), 100, 1.0)
        .unwrap();
    app.commit().unwrap();

    let mut t = 1_000;
    fill_segments(&storage, &wal_dir, 9, &mut t);

    storage.truncate(300).unwrap();

    // The series was collected at a point where segment 9 was the last one.
    assert_eq!(storage.deleted_until(ref_a), Some(9));
    assert!(storage.iter_series().all(|s| s.ref_id() != ref_a));
    storage.close().unwrap();

    // Its label record was retained in the checkpoint, so replay resolves
    // the ref again; without samples it comes back with no timestamp and
    // ages out at the next truncation.
    let storage = open(temp_dir.path());
    let revived = storage
        .iter_series()
        .find(|s| s.ref_id() == ref_a)
        .expect("label record must be retained for deleted series");
    assert_eq!(revived.last_timestamp(), 0);
    storage.close().unwrap();
}

#[test]
fn test_deleted_entry_purged_once_checkpoint_passes_it() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(temp_dir.path());
    let wal_dir = wal_sub_directory(temp_dir.path());

    let mut app = storage.appender();
    let ref_a = app
        .append(0, &Labels::from_pairs([("__name__", "shortlived")]), 100, 1.0)
        .unwrap();
    app.commit().unwrap();

    let mut t = 1_000;
    fill_segments(&storage, &wal_dir, 9, &mut t);
    storage.truncate(300).unwrap();

    let recorded_at = storage.deleted_until(ref_a).expect("tracked after gc");

    // Keep compacting; the entry survives, unchanged, until a truncation
    // whose segment range starts past the segment it was recorded against.
    for _ in 0..8 {
        if storage.deleted_until(ref_a).is_none() {
            break;
        }
        assert_eq!(storage.deleted_until(ref_a), Some(recorded_at));
        let (_, last) = Wal::segments(&wal_dir).unwrap().unwrap();
        fill_segments(&storage, &wal_dir, last + 10, &mut t);
        storage.truncate(300).unwrap();
    }

    assert_eq!(storage.deleted_until(ref_a), None);
    let (first, _) = Wal::segments(&wal_dir).unwrap().unwrap();
    assert!(first > recorded_at, "truncation advanced past segment {recorded_at}");
    storage.close().unwrap();
}

#[test]
fn test_truncate_with_single_segment_is_a_noop() {
    let temp_dir = TempDir::new().unwrap();
    let storage = open(temp_dir.path());
    let wal_dir = wal_sub_directory(temp_dir.path());

    let mut app = storage.appender();
    app.append(0, &filler_labels(), 1_000, 1.0).unwrap();
    app.commit().unwrap();

    storage.truncate(0).unwrap();

    // Not enough segments to compact: only the roll happened.
    assert_eq!(Wal::segments(&wal_dir).unwrap(), Some((0, 1)));
    assert!(alopex_vixen::wal::checkpoint::last_checkpoint(&wal_dir)
        .unwrap()
        .is_none());
    storage.close().unwrap();
}
