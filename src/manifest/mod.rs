//! Manifest manager: the authoritative collection of live manifests for a
//! repository session.
//!
//! Mutations land in a pending log and in the in-memory index at the same
//! time, so reads observe their own writes before any flush. A flush drains
//! the log into exactly one new block; an empty log writes nothing. On open
//! every known block is fetched in parallel and merged entry-by-entry: the
//! newest modification time wins, ties keep the incumbent, and an entry
//! whose winning version is a tombstone is dropped from the index. Crossing
//! the auto-compaction threshold on open rewrites everything into a single
//! block.

mod codec;
mod entry;
mod load;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::block::{BlockId, BlockStore};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use entry::{labels_match, merge_entry, TYPE_LABEL};

pub use entry::{EntryId, EntryMetadata, Labels, ManifestEntry};

/// Namespace tag manifest blocks carry in the block store.
pub const MANIFEST_BLOCK_PREFIX: &str = "m";

/// Tuning knobs, threaded explicitly instead of living in process globals.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Worker threads fetching blocks during open.
    pub load_workers: usize,
    /// Block count above which open compacts immediately.
    pub auto_compact_threshold: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            load_workers: 8,
            auto_compact_threshold: 16,
        }
    }
}

/// Organizes the JSON manifests of a repository: snapshot descriptors,
/// policies, retention rules.
///
/// A single exclusive mutex guards the entry index, the pending log, and
/// the known-blocks list; every public operation serializes on it, reads
/// included. Construction performs the initial load; a manager whose load
/// failed is never handed out.
pub struct ManifestManager {
    store: Arc<dyn BlockStore>,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    /// Live entries only; tombstones are erased during reconciliation.
    entries: HashMap<EntryId, Arc<ManifestEntry>>,
    /// Puts and tombstones awaiting the next flush, in mutation order.
    pending: Vec<Arc<ManifestEntry>>,
    /// Blocks contributing to the current state, in load order.
    block_ids: Vec<BlockId>,
}

impl ManifestManager {
    /// Opens the manifests stored under `store`, loading and merging every
    /// known block before returning.
    pub fn open(ctx: &CancelToken, store: Arc<dyn BlockStore>) -> Result<Self> {
        Self::open_with_options(ctx, store, ManagerOptions::default())
    }

    pub fn open_with_options(
        ctx: &CancelToken,
        store: Arc<dyn BlockStore>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let manager = Self {
            store,
            options,
            state: Mutex::new(ManagerState::default()),
        };
        manager.load(ctx)?;
        Ok(manager)
    }

    /// Serializes `payload` as JSON and records it under a fresh id. The
    /// `type` label is required and must be non-empty.
    pub fn put<T: Serialize + ?Sized>(&self, labels: &Labels, payload: &T) -> Result<EntryId> {
        if labels.get(TYPE_LABEL).map_or(true, String::is_empty) {
            return Err(Error::InvalidArgument("'type' label is required".into()));
        }

        let mut state = self.state.lock();
        let entry = Arc::new(ManifestEntry {
            id: EntryId::generate(),
            mod_time: Utc::now(),
            labels: labels.clone(),
            deleted: false,
            content: Bytes::from(serde_json::to_vec(payload)?),
        });

        state.pending.push(entry.clone());
        state.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry.id.clone())
    }

    /// Deserializes the stored payload into `T`.
    pub fn get<T: DeserializeOwned>(&self, id: &EntryId) -> Result<T> {
        let raw = self.get_raw(id)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Raw JSON payload bytes. The returned buffer may share storage with
    /// the live entry; callers must not assume exclusivity.
    pub fn get_raw(&self, id: &EntryId) -> Result<Bytes> {
        let state = self.state.lock();
        state
            .entries
            .get(id)
            .map(|entry| entry.content.clone())
            .ok_or(Error::NotFound)
    }

    /// Deep-copied metadata for one entry.
    pub fn get_metadata(&self, id: &EntryId) -> Result<EntryMetadata> {
        let state = self.state.lock();
        state
            .entries
            .get(id)
            .map(|entry| EntryMetadata::from(entry.as_ref()))
            .ok_or(Error::NotFound)
    }

    /// All live entries whose labels contain every pair in `query`, sorted
    /// ascending by modification time with id as the tie-break.
    pub fn find(&self, query: &Labels) -> Vec<EntryMetadata> {
        let state = self.state.lock();
        let mut matches: Vec<EntryMetadata> = state
            .entries
            .values()
            .filter(|entry| labels_match(&entry.labels, query))
            .map(|entry| EntryMetadata::from(entry.as_ref()))
            .collect();
        matches.sort_by(|a, b| a.mod_time.cmp(&b.mod_time).then_with(|| a.id.cmp(&b.id)));
        matches
    }

    /// Marks `id` for deletion. Unknown ids are a no-op.
    pub fn delete(&self, id: &EntryId) {
        let mut state = self.state.lock();
        if state.entries.remove(id).is_none() {
            return;
        }
        state
            .pending
            .push(Arc::new(ManifestEntry::tombstone(id.clone(), Utc::now())));
    }

    /// Persists pending mutations as at most one new block. On failure the
    /// pending log is retained for retry and the known blocks are untouched.
    pub fn flush(&self, ctx: &CancelToken) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(block_id) = self.flush_pending_locked(ctx, &mut state)? {
            state.block_ids.push(block_id);
        }
        Ok(())
    }

    /// Rewrites every live entry into a single block and deletes the
    /// predecessors. Interruption mid-delete leaves redundant blocks behind;
    /// the next open merges them harmlessly and a later compaction removes
    /// them.
    pub fn compact(&self, ctx: &CancelToken) -> Result<()> {
        let mut state = self.state.lock();
        self.compact_locked(ctx, &mut state)
    }

    /// Snapshot of the blocks contributing to the current state, in load
    /// order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.state.lock().block_ids.clone()
    }

    fn load(&self, ctx: &CancelToken) -> Result<()> {
        self.flush(ctx)?;

        let mut state = self.state.lock();
        state.entries.clear();

        debug!("listing manifest blocks");
        let blocks = self
            .store
            .list_blocks(MANIFEST_BLOCK_PREFIX)
            .map_err(Error::from_store)?;
        debug!(blocks = blocks.len(), "found manifest blocks");

        state.block_ids = blocks.iter().map(|info| info.id.clone()).collect();

        let loaded = load::load_blocks(
            ctx,
            self.store.as_ref(),
            &state.block_ids,
            self.options.load_workers,
        )?;
        for entries in loaded {
            for entry in entries {
                merge_entry(&mut state.entries, Arc::new(entry));
            }
        }
        // Tombstones only participate in the merge; the index holds live
        // entries.
        state.entries.retain(|_, entry| !entry.deleted);

        if blocks.len() > self.options.auto_compact_threshold {
            debug!(blocks = blocks.len(), "performing automatic compaction");
            self.compact_locked(ctx, &mut state)?;
            self.store.flush(ctx).map_err(Error::from_store)?;
        }

        Ok(())
    }

    fn flush_pending_locked(
        &self,
        ctx: &CancelToken,
        state: &mut ManagerState,
    ) -> Result<Option<BlockId>> {
        if state.pending.is_empty() {
            return Ok(None);
        }
        ctx.check()?;

        let encoded = codec::encode(&state.pending)?;
        let block_id = self
            .store
            .write_block(ctx, &encoded, MANIFEST_BLOCK_PREFIX)
            .map_err(Error::from_store)?;
        debug!(
            block = %block_id,
            entries = state.pending.len(),
            "flushed pending manifest entries"
        );

        state.pending.clear();
        Ok(Some(block_id))
    }

    fn compact_locked(&self, ctx: &CancelToken, state: &mut ManagerState) -> Result<()> {
        debug!(
            pending = state.pending.len(),
            blocks = state.block_ids.len(),
            "compacting manifest blocks"
        );

        if state.block_ids.len() == 1 && state.pending.is_empty() {
            return Ok(());
        }

        let live: Vec<Arc<ManifestEntry>> = state.entries.values().cloned().collect();
        state.pending.extend(live);

        let new_id = self.flush_pending_locked(ctx, state)?;
        if let Some(id) = &new_id {
            // Content addressing may make the new block coincide with an old
            // one, so the comparison below has to happen after the write.
            state.block_ids.push(id.clone());
        }

        for old in &state.block_ids {
            if new_id.as_ref() == Some(old) {
                // Never delete the block that was just written.
                continue;
            }
            self.store.delete_block(old).map_err(Error::from_store)?;
        }

        state.block_ids = new_id.into_iter().collect();
        Ok(())
    }
}

/// Decodes the entries of a raw manifest block, for inspection tooling.
pub fn decode_block_entries(id: &BlockId, data: &[u8]) -> Result<Vec<ManifestEntry>> {
    codec::decode(id, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;

    fn typed(kind: &str) -> Labels {
        Labels::from([("type".to_string(), kind.to_string())])
    }

    #[test]
    fn put_requires_non_empty_type_label() -> Result<()> {
        let ctx = CancelToken::new();
        let manager = ManifestManager::open(&ctx, Arc::new(MemBlockStore::new()))?;

        let err = manager
            .put(&Labels::new(), &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = manager
            .put(
                &Labels::from([("type".to_string(), String::new())]),
                &serde_json::json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        Ok(())
    }

    #[test]
    fn reads_observe_writes_before_any_flush() -> Result<()> {
        let ctx = CancelToken::new();
        let manager = ManifestManager::open(&ctx, Arc::new(MemBlockStore::new()))?;

        let id = manager.put(&typed("policy"), &serde_json::json!({"x": 1}))?;
        let metadata = manager.get_metadata(&id)?;
        assert_eq!(metadata.labels, typed("policy"));
        assert_eq!(metadata.length, 7);

        let value: serde_json::Value = manager.get(&id)?;
        assert_eq!(value, serde_json::json!({"x": 1}));
        assert!(manager.block_ids().is_empty(), "no flush happened yet");
        Ok(())
    }

    #[test]
    fn empty_flush_writes_no_block() -> Result<()> {
        let ctx = CancelToken::new();
        let store = Arc::new(MemBlockStore::new());
        let manager = ManifestManager::open(&ctx, store.clone())?;

        manager.flush(&ctx)?;
        assert!(manager.block_ids().is_empty());

        manager.put(&typed("snap"), &serde_json::json!({"n": 1}))?;
        manager.flush(&ctx)?;
        manager.flush(&ctx)?;
        assert_eq!(manager.block_ids().len(), 1);
        Ok(())
    }

    #[test]
    fn deleting_unknown_id_is_a_no_op() -> Result<()> {
        let ctx = CancelToken::new();
        let manager = ManifestManager::open(&ctx, Arc::new(MemBlockStore::new()))?;

        manager.delete(&EntryId::generate());
        manager.flush(&ctx)?;
        assert!(manager.block_ids().is_empty());
        Ok(())
    }
}
