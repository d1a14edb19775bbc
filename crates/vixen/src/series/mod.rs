//! In-memory series records and the striped series index.
//!
//! The index is sharded twice over the same shard array: shard `i` holds
//! the label-hash entries whose low hash bits equal `i` and the ref entries
//! whose low ref bits equal `i`. A shard lock guards both maps of its
//! shard; shard locks are only ever taken one at a time.

use crate::labels::Labels;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An exemplar attached to a series.
#[derive(Debug, Clone)]
pub struct Exemplar {
    /// Exemplar label set (e.g. a trace id).
    pub labels: Labels,
    /// Timestamp in milliseconds since the epoch.
    pub t: i64,
    /// Exemplar value.
    pub v: f64,
}

impl PartialEq for Exemplar {
    fn eq(&self, other: &Self) -> bool {
        // Two NaN values compare equal so duplicate staleness exemplars are
        // still detected.
        self.labels == other.labels
            && self.t == other.t
            && (self.v == other.v || (self.v.is_nan() && other.v.is_nan()))
    }
}

struct MemSeriesState {
    last_ts: i64,
    pending_commit: bool,
    latest_exemplar: Option<Exemplar>,
}

/// In-memory record of a live series.
pub struct MemSeries {
    ref_id: u64,
    labels: Labels,
    state: Mutex<MemSeriesState>,
}

impl MemSeries {
    pub(crate) fn new(ref_id: u64, labels: Labels, pending_commit: bool) -> Self {
        Self {
            ref_id,
            labels,
            state: Mutex::new(MemSeriesState {
                last_ts: 0,
                pending_commit,
                latest_exemplar: None,
            }),
        }
    }

    /// Returns the series reference id.
    pub fn ref_id(&self) -> u64 {
        self.ref_id
    }

    /// Returns the identifying label set.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Returns the timestamp of the newest sample seen for this series.
    pub fn last_timestamp(&self) -> i64 {
        self.state.lock().last_ts
    }

    /// Returns true while the series has an appended but uncommitted sample.
    pub fn pending_commit(&self) -> bool {
        self.state.lock().pending_commit
    }

    /// Records an appended sample: advances `last_ts` (max) and pins the
    /// series against garbage collection until the batch commits.
    pub(crate) fn note_append(&self, t: i64) {
        let mut state = self.state.lock();
        if t > state.last_ts {
            state.last_ts = t;
        }
        state.pending_commit = true;
    }

    /// Records a replayed sample timestamp; max-only, no pinning.
    pub(crate) fn note_replayed(&self, t: i64) {
        let mut state = self.state.lock();
        if t > state.last_ts {
            state.last_ts = t;
        }
    }

    pub(crate) fn clear_pending(&self) {
        self.state.lock().pending_commit = false;
    }
}

struct Shard {
    hashes: HashMap<u64, Vec<Arc<MemSeries>>>,
    refs: HashMap<u64, Arc<MemSeries>>,
}

/// Striped two-way index of live series: label hash → series and
/// ref → series.
pub(crate) struct StripeSeries {
    shards: Vec<Mutex<Shard>>,
    mask: u64,
}

impl StripeSeries {
    /// Creates an index with `size` shards. `size` must be a power of two.
    pub(crate) fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        let shards = (0..size)
            .map(|_| {
                Mutex::new(Shard {
                    hashes: HashMap::new(),
                    refs: HashMap::new(),
                })
            })
            .collect();
        Self {
            shards,
            mask: size as u64 - 1,
        }
    }

    fn hash_shard(&self, hash: u64) -> &Mutex<Shard> {
        &self.shards[(hash & self.mask) as usize]
    }

    fn ref_shard(&self, ref_id: u64) -> &Mutex<Shard> {
        &self.shards[(ref_id & self.mask) as usize]
    }

    /// Looks a series up by label hash, resolving collisions by equality.
    pub(crate) fn get_by_hash(&self, hash: u64, labels: &Labels) -> Option<Arc<MemSeries>> {
        let shard = self.hash_shard(hash).lock();
        shard
            .hashes
            .get(&hash)?
            .iter()
            .find(|s| s.labels() == labels)
            .cloned()
    }

    /// Looks a series up by reference id.
    pub(crate) fn get_by_id(&self, ref_id: u64) -> Option<Arc<MemSeries>> {
        self.ref_shard(ref_id).lock().refs.get(&ref_id).cloned()
    }

    /// Inserts a series into both maps.
    pub(crate) fn set(&self, hash: u64, series: Arc<MemSeries>) {
        self.hash_shard(hash)
            .lock()
            .hashes
            .entry(hash)
            .or_default()
            .push(series.clone());
        self.ref_shard(series.ref_id())
            .lock()
            .refs
            .insert(series.ref_id(), series);
    }

    /// Returns the series for `labels`, creating it with `make` when absent.
    ///
    /// The existence check and the hash-map insert happen under one shard
    /// lock, so two racing appenders cannot create the same series twice.
    pub(crate) fn get_or_create(
        &self,
        hash: u64,
        labels: &Labels,
        make: impl FnOnce() -> Arc<MemSeries>,
    ) -> (Arc<MemSeries>, bool) {
        let series;
        {
            let mut shard = self.hash_shard(hash).lock();
            if let Some(found) = shard
                .hashes
                .get(&hash)
                .and_then(|list| list.iter().find(|s| s.labels() == labels))
            {
                return (found.clone(), false);
            }
            series = make();
            shard.hashes.entry(hash).or_default().push(series.clone());
        }
        self.ref_shard(series.ref_id())
            .lock()
            .refs
            .insert(series.ref_id(), series.clone());
        (series, true)
    }

    /// Removes all series whose last timestamp is below `mint` and that are
    /// not pinned by an uncommitted append. Returns the removed refs.
    pub(crate) fn gc(&self, mint: i64) -> HashSet<u64> {
        let mut deleted = HashSet::new();
        let mut unlinked: Vec<Arc<MemSeries>> = Vec::new();

        for shard in &self.shards {
            let mut guard = shard.lock();
            guard.hashes.retain(|_, list| {
                list.retain(|series| {
                    let state = series.state.lock();
                    if state.last_ts >= mint || state.pending_commit {
                        true
                    } else {
                        deleted.insert(series.ref_id());
                        unlinked.push(series.clone());
                        false
                    }
                });
                !list.is_empty()
            });
        }

        // Ref-map entries live in a different shard than the hash entry;
        // fix them up after every hash-shard lock has been released.
        for series in unlinked {
            self.ref_shard(series.ref_id())
                .lock()
                .refs
                .remove(&series.ref_id());
        }

        deleted
    }

    /// Snapshots all live series. Each shard is read under its lock, so the
    /// view is consistent per shard and safe against concurrent appends.
    pub(crate) fn iter(&self) -> Vec<Arc<MemSeries>> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock();
            all.extend(guard.refs.values().cloned());
        }
        all
    }

    /// Returns the number of live series.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().refs.len()).sum()
    }

    /// Returns the newest exemplar recorded for a series.
    pub(crate) fn latest_exemplar(&self, ref_id: u64) -> Option<Exemplar> {
        let series = self.get_by_id(ref_id)?;
        let state = series.state.lock();
        state.latest_exemplar.clone()
    }

    /// Replaces the newest exemplar for a series under the series lock.
    pub(crate) fn set_latest_exemplar(&self, ref_id: u64, exemplar: Exemplar) {
        if let Some(series) = self.get_by_id(ref_id) {
            series.state.lock().latest_exemplar = Some(exemplar);
        }
    }
}
