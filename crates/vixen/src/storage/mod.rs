//! Storage engine: orchestrates appenders, replay, garbage collection,
//! checkpointing, staleness markers and lifecycle.
//!
//! The engine owns the segmented log and the stripe index. Appenders buffer
//! batches in memory and, on commit, write Series, Samples and Exemplars
//! records to the log in that order, so a replayer always sees a series
//! definition before any sample referencing it.
//!
//! ```text
//! Appender ─ commit ─▶ Wal ─ segments ─▶ checkpoint ─▶ truncate
//!     │                                      ▲
//!     └────────▶ StripeSeries ── gc ─────────┘
//! ```

use crate::config::StorageConfig;
use crate::error::{Result, WalError};
use crate::labels::Labels;
use crate::metrics::StorageMetrics;
use crate::record::{self, RecordType, RefExemplar, RefSample, RefSeries};
use crate::series::{Exemplar, MemSeries, StripeSeries};
use crate::wal::{checkpoint, Wal, WalReader};
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Maximum combined rune length of an exemplar's label names and values.
pub const EXEMPLAR_MAX_LABEL_SET_LENGTH: usize = 128;

const STALENESS_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const STALENESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Returns the WAL directory for a storage rooted at `path`.
pub fn wal_sub_directory(path: &Path) -> PathBuf {
    path.join("wal")
}

struct StorageInner {
    path: PathBuf,
    wal: Wal,
    // Guards log open/close: commits take the read side, close takes the
    // write side. Once `true`, all WAL-mutating operations fail.
    wal_closed: RwLock<bool>,
    series: StripeSeries,
    // Refs of GC'd series and the segment their label record must outlive.
    deleted: Mutex<HashMap<u64, u64>>,
    ref_source: Arc<AtomicU64>,
    appender_pool: Mutex<Vec<AppenderBatch>>,
    buf_pool: Mutex<Vec<Vec<u8>>>,
    metrics: StorageMetrics,
}

/// WAL-backed, write-only time series storage.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

enum ReplayError {
    Fatal(WalError),
    Corruption {
        segment: u64,
        offset: u64,
        cause: String,
    },
}

impl ReplayError {
    fn into_wal_error(self) -> WalError {
        match self {
            ReplayError::Fatal(err) => err,
            ReplayError::Corruption {
                segment,
                offset,
                cause,
            } => WalError::Corruption {
                segment,
                offset,
                cause,
            },
        }
    }
}

impl Storage {
    /// Opens the storage rooted at `path`, replaying the WAL in
    /// `path/wal/`. A fresh ref source is created; use
    /// [`Storage::open_with_ref_source`] to share one across storages.
    pub fn open(
        path: impl AsRef<Path>,
        config: StorageConfig,
        registry: Option<&Registry>,
    ) -> Result<Self> {
        Self::open_with_ref_source(path, config, registry, Arc::new(AtomicU64::new(0)))
    }

    /// Opens the storage with an externally owned series ref counter.
    ///
    /// Replay advances the counter past every ref found in the journal, so
    /// refs stay unique when several storages share the source.
    pub fn open_with_ref_source(
        path: impl AsRef<Path>,
        config: StorageConfig,
        registry: Option<&Registry>,
        ref_source: Arc<AtomicU64>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let wal = Wal::with_segment_size(wal_sub_directory(&path), config.segment_size)?;
        let stripe_size = config.stripe_size.max(1).next_power_of_two();

        let storage = Self {
            inner: Arc::new(StorageInner {
                path,
                wal,
                wal_closed: RwLock::new(false),
                series: StripeSeries::new(stripe_size),
                deleted: Mutex::new(HashMap::new()),
                ref_source,
                appender_pool: Mutex::new(Vec::new()),
                buf_pool: Mutex::new(Vec::new()),
                metrics: StorageMetrics::new(registry)?,
            }),
        };

        if let Err(err) = storage.replay() {
            match err {
                ReplayError::Corruption {
                    segment,
                    offset,
                    cause,
                } => {
                    warn!(
                        segment,
                        offset,
                        cause = %cause,
                        "encountered WAL read error, attempting repair"
                    );
                    storage.inner.wal.repair(segment, offset)?;
                    storage
                        .replay()
                        .map_err(ReplayError::into_wal_error)?;
                }
                fatal => return Err(fatal.into_wal_error()),
            }
        }

        Ok(storage)
    }

    /// Returns the root directory of the storage.
    pub fn directory(&self) -> &Path {
        &self.inner.path
    }

    /// Hands out a pooled appender.
    pub fn appender(&self) -> Appender {
        let batch = self
            .inner
            .appender_pool
            .lock()
            .pop()
            .unwrap_or_else(AppenderBatch::with_capacity);
        Appender {
            storage: self.inner.clone(),
            batch,
        }
    }

    /// Snapshots all live series for the shipper.
    ///
    /// The snapshot is consistent per index shard and safe to take while
    /// appends are in flight.
    pub fn iter_series(&self) -> impl Iterator<Item = Arc<MemSeries>> {
        self.inner.series.iter().into_iter()
    }

    /// Returns the segment a GC'd series' label record must be retained
    /// until, if the series is currently tracked as deleted.
    pub fn deleted_until(&self, ref_id: u64) -> Option<u64> {
        self.inner.deleted.lock().get(&ref_id).copied()
    }

    /// Removes all data from the WAL prior to `mint`.
    ///
    /// Garbage-collects stale series, rolls the log, compacts the lower
    /// two thirds of the resulting segment range into a checkpoint and
    /// deletes the segments it covers. Segment deletion and old-checkpoint
    /// deletion are best-effort; failures are logged and retried by the
    /// next truncation.
    pub fn truncate(&self, mint: i64) -> Result<()> {
        let inner = &*self.inner;
        let closed = inner.wal_closed.read();
        if *closed {
            return Err(WalError::Closed);
        }

        let start = Instant::now();
        self.gc(mint);
        info!(duration = ?start.elapsed(), "series GC completed");

        let range = Wal::segments(inner.wal.dir())?;
        // Roll so low-volume instances don't keep a fat active segment.
        inner.wal.next_segment()?;

        let Some((first, last)) = range else {
            return Ok(());
        };
        // Never consider the active segment for checkpointing.
        let Some(last) = last.checked_sub(1) else {
            return Ok(());
        };
        if last <= first {
            // Less than two full segments; not worth compacting yet.
            return Ok(());
        }

        // The lower two thirds of segments hold mostly obsolete samples.
        let checkpoint_up_to = first + (last - first) * 2 / 3;
        if checkpoint_up_to <= first {
            return Ok(());
        }

        let keep = |ref_id: u64| {
            if inner.series.get_by_id(ref_id).is_some() {
                return true;
            }
            inner.deleted.lock().contains_key(&ref_id)
        };
        checkpoint::checkpoint(
            inner.wal.dir(),
            inner.wal.segment_size(),
            first,
            checkpoint_up_to,
            keep,
            mint,
        )?;

        if let Err(err) = inner.wal.truncate(checkpoint_up_to + 1) {
            // Leftover segments are superseded by the checkpoint and get
            // ignored; retry at the next truncation.
            error!(error = %err, "truncating segments failed");
        }

        // Series deleted before the checkpointed range no longer need their
        // label records retained.
        {
            let mut deleted = inner.deleted.lock();
            let before = deleted.len();
            deleted.retain(|_, segment| *segment >= first);
            inner
                .metrics
                .removed_series_total
                .inc_by((before - deleted.len()) as u64);
            inner.metrics.deleted_series.set(deleted.len() as i64);
        }

        if let Err(err) = checkpoint::delete_checkpoints(inner.wal.dir(), checkpoint_up_to) {
            // Old checkpoints only occupy disk space; a higher checkpoint
            // always wins.
            error!(error = %err, "deleting old checkpoints failed");
        }

        info!(
            first,
            last = checkpoint_up_to,
            duration = ?start.elapsed(),
            "WAL checkpoint complete"
        );
        Ok(())
    }

    /// Appends a staleness marker for every live series and waits for the
    /// remote end to acknowledge it.
    ///
    /// `remote_ts` reports the newest timestamp the shipper has sent
    /// downstream; it is polled every 5 seconds for up to a minute against
    /// the second-truncated staleness timestamp. A timeout is logged but is
    /// not an error to the caller.
    pub fn write_staleness_markers(&self, remote_ts: impl Fn() -> i64) -> Result<()> {
        let mut last_err = None;
        let mut last_ts = 0i64;

        let mut app = self.appender();
        for series in self.iter_series() {
            let ts = now_ms();
            if let Err(err) = app.append(series.ref_id(), series.labels(), ts, record::stale_nan())
            {
                last_err = Some(err);
            }
            // The remote write timestamp only has second precision.
            last_ts = (ts / 1000) * 1000;
        }

        if last_err.is_none() {
            app.commit()?;

            info!("waiting for remote write to write staleness markers...");
            let start = Instant::now();
            loop {
                let written_ts = remote_ts();
                if written_ts >= last_ts {
                    info!(duration = ?start.elapsed(), "remote write wrote staleness markers");
                    break;
                }
                if start.elapsed() >= STALENESS_WAIT_TIMEOUT {
                    error!("timed out waiting for staleness markers to be written");
                    break;
                }
                info!(
                    remote_ts = written_ts,
                    last_ts, "remote write hasn't written staleness markers yet"
                );
                std::thread::sleep(STALENESS_POLL_INTERVAL);
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes the storage and its underlying resources.
    ///
    /// The first call succeeds and fails all subsequent WAL operations with
    /// [`WalError::Closed`]; further close calls return the same error.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.inner.wal_closed.write();
        if *closed {
            return Err(WalError::Closed);
        }
        *closed = true;

        self.inner.metrics.unregister();
        self.inner.wal.close()
    }

    fn gc(&self, mint: i64) {
        let inner = &*self.inner;
        let deleted = inner.series.gc(mint);
        inner.metrics.active_series.sub(deleted.len() as i64);

        let last = match Wal::segments(inner.wal.dir()) {
            Ok(Some((_, last))) => last,
            _ => 0,
        };

        // Keep the label records of freshly deleted series until every
        // segment that may still carry their samples has been truncated;
        // otherwise replay could not resolve those refs.
        let mut map = inner.deleted.lock();
        for ref_id in deleted {
            map.insert(ref_id, last);
        }
        inner.metrics.deleted_series.set(map.len() as i64);
    }

    fn replay(&self) -> std::result::Result<(), ReplayError> {
        let inner = &*self.inner;
        let dir = inner.wal.dir();
        info!(dir = %dir.display(), "replaying WAL, this may take a while");

        let mut start_from = 0u64;
        if let Some((cp_path, cp_index)) =
            checkpoint::last_checkpoint(dir).map_err(ReplayError::Fatal)?
        {
            let mut reader = WalReader::open(&cp_path, 0).map_err(ReplayError::Fatal)?;
            // A corrupted checkpoint is a hard error and requires user
            // intervention; there is little data to recover from it anyway.
            self.load_records(&mut reader).map_err(ReplayError::Fatal)?;
            start_from = cp_index + 1;
            info!("WAL checkpoint loaded");
        }

        let Some((_, last)) = Wal::segments(dir).map_err(ReplayError::Fatal)? else {
            return Ok(());
        };

        for segment in start_from..=last {
            let mut reader =
                WalReader::open_range(dir, segment, segment).map_err(ReplayError::Fatal)?;
            match self.load_records(&mut reader) {
                Ok(()) => {}
                Err(WalError::Corruption {
                    segment,
                    offset,
                    cause,
                }) => {
                    return Err(ReplayError::Corruption {
                        segment,
                        offset,
                        cause,
                    })
                }
                Err(err) => return Err(ReplayError::Fatal(err)),
            }
            info!(segment, max_segment = last, "WAL segment loaded");
        }

        Ok(())
    }

    fn load_records(&self, reader: &mut WalReader) -> Result<()> {
        let inner = &*self.inner;
        let mut rec = Vec::new();
        // Decoder scratch, reused across records of each type.
        let mut series_buf: Vec<RefSeries> = Vec::new();
        let mut samples_buf: Vec<RefSample> = Vec::new();
        let mut biggest_ref = inner.ref_source.load(Ordering::Relaxed);

        while reader.next_record(&mut rec)? {
            match record::record_type(&rec) {
                RecordType::Series => {
                    record::decode_series(&rec, &mut series_buf).map_err(|e| {
                        WalError::Corruption {
                            segment: reader.segment(),
                            offset: reader.offset(),
                            cause: format!("decode series: {e}"),
                        }
                    })?;
                    for s in &series_buf {
                        // A replayed series starts without a timestamp; if
                        // no sample follows it is stale and gets collected
                        // at the next truncation.
                        if inner.series.get_by_id(s.ref_id).is_none() {
                            let series =
                                Arc::new(MemSeries::new(s.ref_id, s.labels.clone(), false));
                            inner.series.set(s.labels.hash(), series);

                            inner.metrics.active_series.inc();
                            inner.metrics.created_series_total.inc();

                            if biggest_ref <= s.ref_id {
                                biggest_ref = s.ref_id;
                            }
                        }
                    }
                }
                RecordType::Samples => {
                    record::decode_samples(&rec, &mut samples_buf).map_err(|e| {
                        WalError::Corruption {
                            segment: reader.segment(),
                            offset: reader.offset(),
                            cause: format!("decode samples: {e}"),
                        }
                    })?;
                    for s in &samples_buf {
                        match inner.series.get_by_id(s.ref_id) {
                            Some(series) => series.note_replayed(s.t),
                            None => warn!(
                                ref_id = s.ref_id,
                                "found sample referencing non-existing series, skipping"
                            ),
                        }
                    }
                }
                // Exemplars are not restored on replay; the first
                // post-restart exemplar of a series is always recorded.
                RecordType::Tombstones | RecordType::Exemplars => continue,
                RecordType::Unknown => {
                    return Err(WalError::Corruption {
                        segment: reader.segment(),
                        offset: reader.offset(),
                        cause: "invalid record type".to_string(),
                    })
                }
            }
        }

        inner.ref_source.fetch_max(biggest_ref, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
struct AppenderBatch {
    series: Vec<RefSeries>,
    samples: Vec<RefSample>,
    exemplars: Vec<RefExemplar>,
}

impl AppenderBatch {
    fn with_capacity() -> Self {
        Self {
            series: Vec::with_capacity(100),
            samples: Vec::with_capacity(100),
            exemplars: Vec::with_capacity(10),
        }
    }

    fn clear(&mut self) {
        self.series.clear();
        self.samples.clear();
        self.exemplars.clear();
    }
}

/// Batches samples, new series and exemplars until committed to the WAL.
///
/// Obtained from [`Storage::appender`]; its buffers return to the storage's
/// pool when the appender is dropped.
pub struct Appender {
    storage: Arc<StorageInner>,
    batch: AppenderBatch,
}

impl Appender {
    /// Buffers one sample, creating the series when needed.
    ///
    /// A non-zero `ref_hint` that resolves in the index bypasses label
    /// processing entirely. Otherwise empty labels are stripped and the
    /// series is looked up or created by label-set hash. Returns the ref to
    /// use as the hint for subsequent appends.
    pub fn append(&mut self, ref_hint: u64, labels: &Labels, t: i64, v: f64) -> Result<u64> {
        let series = match self.storage.series.get_by_id(ref_hint) {
            Some(series) => series,
            None => {
                // Mirror head-appender validation: no empty or duplicate
                // labels make it into the index.
                let stripped = labels.without_empty();
                if stripped.is_empty() {
                    return Err(WalError::InvalidSample("empty label set".to_string()));
                }
                if let Some(name) = stripped.duplicate_name() {
                    return Err(WalError::InvalidSample(format!(
                        "label name {name:?} is not unique"
                    )));
                }

                let hash = stripped.hash();
                let ref_source = &self.storage.ref_source;
                let (series, created) = self.storage.series.get_or_create(hash, &stripped, || {
                    let ref_id = ref_source.fetch_add(1, Ordering::Relaxed) + 1;
                    // Born pinned so GC cannot reap the series before the
                    // batch commits.
                    Arc::new(MemSeries::new(ref_id, stripped.clone(), true))
                });
                if created {
                    self.batch.series.push(RefSeries {
                        ref_id: series.ref_id(),
                        labels: stripped,
                    });
                    self.storage.metrics.active_series.inc();
                    self.storage.metrics.created_series_total.inc();
                }
                series
            }
        };

        // Advances the series timestamp used by GC staleness checks;
        // out-of-order samples are still written to the log.
        series.note_append(t);
        self.batch.samples.push(RefSample {
            ref_id: series.ref_id(),
            t,
            v,
        });

        self.storage.metrics.appended_samples_total.inc();
        Ok(series.ref_id())
    }

    /// Buffers one exemplar for an existing series.
    ///
    /// An exemplar equal to the series' latest one is accepted but not
    /// recorded.
    pub fn append_exemplar(&mut self, ref_id: u64, exemplar: Exemplar) -> Result<()> {
        if self.storage.series.get_by_id(ref_id).is_none() {
            return Err(WalError::UnknownSeries(ref_id));
        }

        let labels = exemplar.labels.without_empty();
        if let Some(name) = labels.duplicate_name() {
            return Err(WalError::InvalidExemplar(format!(
                "label name {name:?} is not unique"
            )));
        }

        // The length budget counts runes of names and values only, not the
        // quotes, equals signs or commas of a rendered label set.
        let mut label_set_len = 0usize;
        for label in &labels {
            label_set_len += label.name.chars().count() + label.value.chars().count();
            if label_set_len > EXEMPLAR_MAX_LABEL_SET_LENGTH {
                return Err(WalError::ExemplarLabelTooLong {
                    max: EXEMPLAR_MAX_LABEL_SET_LENGTH,
                });
            }
        }

        let exemplar = Exemplar {
            labels,
            t: exemplar.t,
            v: exemplar.v,
        };
        if self.storage.series.latest_exemplar(ref_id).as_ref() == Some(&exemplar) {
            // Duplicate of the newest stored exemplar; silently dropped.
            return Ok(());
        }
        self.storage
            .series
            .set_latest_exemplar(ref_id, exemplar.clone());

        self.batch.exemplars.push(RefExemplar {
            ref_id,
            t: exemplar.t,
            v: exemplar.v,
            labels: exemplar.labels,
        });

        self.storage.metrics.appended_exemplars_total.inc();
        Ok(())
    }

    /// Writes the batched records to the WAL and resets the batch.
    ///
    /// Series records are logged before Samples, Samples before Exemplars.
    /// On an I/O error the batch is retained so the caller can retry or
    /// roll back; affected series stay pinned until then.
    pub fn commit(&mut self) -> Result<()> {
        let storage = &self.storage;
        let closed = storage.wal_closed.read();
        if *closed {
            return Err(WalError::Closed);
        }

        let mut buf = storage
            .buf_pool
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(1024));

        let logged = (|| -> Result<()> {
            if !self.batch.series.is_empty() {
                record::encode_series(&self.batch.series, &mut buf);
                storage.wal.log(&buf)?;
            }
            if !self.batch.samples.is_empty() {
                record::encode_samples(&self.batch.samples, &mut buf);
                storage.wal.log(&buf)?;
            }
            if !self.batch.exemplars.is_empty() {
                record::encode_exemplars(&self.batch.exemplars, &mut buf);
                storage.wal.log(&buf)?;
            }
            Ok(())
        })();

        buf.clear();
        storage.buf_pool.lock().push(buf);
        logged?;

        for sample in &self.batch.samples {
            if let Some(series) = storage.series.get_by_id(sample.ref_id) {
                series.clear_pending();
            }
        }
        drop(closed);

        self.batch.clear();
        Ok(())
    }

    /// Discards the batched records without writing anything.
    pub fn rollback(&mut self) {
        self.batch.clear();
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        self.batch.clear();
        let batch = std::mem::take(&mut self.batch);
        self.storage.appender_pool.lock().push(batch);
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
