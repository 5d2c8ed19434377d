//! `manifestdb` keeps the labeled JSON manifests of a content-addressed
//! backup repository: snapshot descriptors, policies, retention rules.
//!
//! This crate is intentionally opinionated about durability first:
//! - Blocks are immutable and content-addressed; a flush appends, never edits.
//! - Deletes are tombstones, reconciled by modification time on open.
//! - Blocks are fetched in parallel on open but merged deterministically.
//! - Compaction can be interrupted at any point without losing live entries.

pub mod block;
pub mod cancel;
pub mod error;
pub mod manifest;

pub use block::{BlockId, BlockInfo, BlockStore, LocalBlockStore, MemBlockStore};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use manifest::{
    EntryId, EntryMetadata, Labels, ManagerOptions, ManifestEntry, ManifestManager,
    MANIFEST_BLOCK_PREFIX,
};
