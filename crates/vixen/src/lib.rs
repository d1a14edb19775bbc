//! Vixen - Alopex WAL-backed time series staging store.
//!
//! This crate is the durable staging buffer between metric ingestion and a
//! downstream remote shipper: samples are journaled to an append-only
//! segmented log while an in-memory stripe index tracks the set of live
//! series. Periodic truncation compacts the log into checkpoints and
//! reclaims obsolete segments. The store is write-only from the outside;
//! the shipper reads the journal through [`WalReader`].
//!
//! # Components
//!
//! - [`Storage`] / [`Appender`]: engine lifecycle, batched appends, replay,
//!   garbage collection and staleness markers
//! - [`Wal`] / [`WalReader`]: page-framed segmented log with tail repair
//! - [`wal::checkpoint`]: compaction of segment prefixes
//! - [`record`]: wire codec for Series, Samples and Exemplars records
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_vixen::{Labels, Storage, StorageConfig};
//!
//! let storage = Storage::open("/data/agent", StorageConfig::default(), None)?;
//!
//! let mut app = storage.appender();
//! let labels = Labels::from_pairs([("__name__", "up"), ("job", "node")]);
//! let ref_id = app.append(0, &labels, now_ms, 1.0)?;
//! app.append(ref_id, &labels, now_ms + 15_000, 1.0)?;
//! app.commit()?;
//!
//! // Periodically compact everything older than two hours.
//! storage.truncate(now_ms - 2 * 3_600_000)?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod labels;
mod metrics;
pub mod record;
pub mod series;
pub mod storage;
pub mod wal;

pub use config::StorageConfig;
pub use error::{Result, WalError};
pub use labels::{Label, Labels};
pub use series::{Exemplar, MemSeries};
pub use storage::{Appender, Storage, EXEMPLAR_MAX_LABEL_SET_LENGTH};
pub use wal::{Wal, WalReader, DEFAULT_SEGMENT_SIZE};
