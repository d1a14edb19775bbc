//! Error and Result types for Vixen WAL storage operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Vixen operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// The error type for WAL storage operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// The storage has been closed; no further WAL operations are possible.
    #[error("WAL storage closed")]
    Closed,

    /// A sample failed validation before being accepted into a batch.
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// An exemplar failed validation before being accepted into a batch.
    #[error("invalid exemplar: {0}")]
    InvalidExemplar(String),

    /// The combined rune length of an exemplar's label set exceeds the limit.
    #[error("exemplar label set exceeds {max} characters")]
    ExemplarLabelTooLong {
        /// Maximum combined rune length of names and values.
        max: usize,
    },

    /// An exemplar referenced a series ref that is not in the index.
    #[error("unknown series ref {0}")]
    UnknownSeries(u64),

    /// A segment record failed framing, checksum or decode validation.
    #[error("corruption in segment {segment} at offset {offset}: {cause}")]
    Corruption {
        /// Segment number the corruption was found in.
        segment: u64,
        /// Byte offset of the first fragment of the corrupt record.
        offset: u64,
        /// Human-readable description of the failure.
        cause: String,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A metrics collector could not be registered or created.
    #[error("metrics registration: {0}")]
    Metrics(String),
}
