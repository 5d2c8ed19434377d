use thiserror::Error;

use crate::block::BlockId;

/// A manifest Result returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Manifest manager errors.
///
/// The manager never retries and never mutates state on a failing path: a
/// failed flush keeps the pending log, a failed load leaves the manager
/// unusable, and callers see the collaborator's error unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// The manifest id is unknown or tombstoned. Recoverable by the caller.
    #[error("manifest not found")]
    NotFound,

    /// Caller bug, e.g. a missing `type` label or a malformed id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A payload could not be encoded as JSON, or stored JSON no longer
    /// matches the caller's type.
    #[error("manifest JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure while building a manifest block.
    #[error("manifest block I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted block failed format detection or parse. Fatal to the
    /// load or compaction that touched it.
    #[error("corrupted manifest block {id}: {reason}")]
    CorruptedBlock { id: BlockId, reason: String },

    /// Collaborator-reported failure, propagated unchanged.
    #[error("block store: {0}")]
    Store(anyhow::Error),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wraps a block-store failure. A typed error raised behind the trait
    /// boundary (cancellation, usually) is recovered as-is instead of being
    /// double-wrapped.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(typed) => typed,
            Err(err) => Error::Store(err),
        }
    }
}
