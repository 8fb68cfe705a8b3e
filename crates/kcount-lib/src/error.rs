//! Error types for the counting engine

use std::path::PathBuf;

use thiserror::Error;

use crate::encoding::EncodingError;

/// Errors raised while configuring, counting, dumping or merging.
#[derive(Error, Debug)]
pub enum CountError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration parameter
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The table filled up and could neither grow nor be dumped
    #[error("hash table of {size} slots is full (generation {generation}) and cannot grow or be dumped")]
    TableFull {
        /// Number of slots in the full table
        size: usize,
        /// Table generation that filled up
        generation: u64,
    },

    /// `update_add` on a key that was never primed
    #[error("key was not primed before update")]
    NotPrimed,

    /// Accumulation was requested before every worker finished priming
    #[error("priming incomplete: {done} of {expected} workers finished")]
    PrimingIncomplete {
        /// Workers that called `done`
        done: usize,
        /// Workers in the pass
        expected: usize,
    },

    /// A bloom counter snapshot could not be used
    #[error("invalid bloom counter {path:?}: {reason}")]
    BloomFormat {
        /// Snapshot path
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Artifacts could not be merged
    #[error("cannot merge {path:?}: {reason}")]
    Merge {
        /// The offending artifact
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Malformed artifact content
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    /// The pass was interrupted by a shutdown request
    #[error("counting interrupted")]
    Cancelled,

    /// A worker thread panicked
    #[error("worker thread panicked")]
    WorkerPanicked,

    /// Bad base or k-mer string
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Result type for the counting engine
pub type Result<T> = std::result::Result<T, CountError>;
