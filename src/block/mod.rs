//! Content-addressed block store collaborator.
//!
//! The manifest manager persists into an append-only store of immutable
//! blocks: the same bytes under the same namespace prefix always yield the
//! same identifier, listing is by prefix, and deletion is only ever issued
//! by compaction. The store is assumed thread-safe by its own contract.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cancel::CancelToken;

/// Content-addressed block identifier: the namespace prefix followed by the
/// blake3 hex digest of the block payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the identifier a write of `data` under `prefix` produces.
    pub fn from_content(prefix: &str, data: &[u8]) -> Self {
        Self(format!("{prefix}{}", blake3::hash(data).to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Listing record for one stored block.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub id: BlockId,
    pub timestamp: DateTime<Utc>,
    pub length: u64,
}

/// Capability set the manifest manager requires from the repository's block
/// store. Implementations must be safe to share across threads.
pub trait BlockStore: Send + Sync {
    /// Content-addressed write: identical bytes yield identical ids.
    fn write_block(&self, ctx: &CancelToken, data: &[u8], prefix: &str)
        -> anyhow::Result<BlockId>;

    fn get_block(&self, ctx: &CancelToken, id: &BlockId) -> anyhow::Result<Vec<u8>>;

    fn list_blocks(&self, prefix: &str) -> anyhow::Result<Vec<BlockInfo>>;

    fn delete_block(&self, id: &BlockId) -> anyhow::Result<()>;

    /// Drains any buffers the store keeps on its own behalf.
    fn flush(&self, ctx: &CancelToken) -> anyhow::Result<()>;
}

/// In-memory block store. Preserves write order for listing so loads see
/// blocks oldest-first.
#[derive(Debug, Default)]
pub struct MemBlockStore {
    inner: Mutex<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    blocks: HashMap<BlockId, MemBlock>,
    order: Vec<BlockId>,
}

#[derive(Debug)]
struct MemBlock {
    timestamp: DateTime<Utc>,
    data: Bytes,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemBlockStore {
    fn write_block(
        &self,
        ctx: &CancelToken,
        data: &[u8],
        prefix: &str,
    ) -> anyhow::Result<BlockId> {
        ctx.check()?;
        let id = BlockId::from_content(prefix, data);
        let mut inner = self.inner.lock();
        if !inner.blocks.contains_key(&id) {
            inner.blocks.insert(
                id.clone(),
                MemBlock {
                    timestamp: Utc::now(),
                    data: Bytes::copy_from_slice(data),
                },
            );
            inner.order.push(id.clone());
        }
        Ok(id)
    }

    fn get_block(&self, ctx: &CancelToken, id: &BlockId) -> anyhow::Result<Vec<u8>> {
        ctx.check()?;
        let inner = self.inner.lock();
        let block = inner
            .blocks
            .get(id)
            .with_context(|| format!("block {id} not found"))?;
        Ok(block.data.to_vec())
    }

    fn list_blocks(&self, prefix: &str) -> anyhow::Result<Vec<BlockInfo>> {
        let inner = self.inner.lock();
        let mut infos = Vec::new();
        for id in &inner.order {
            if !id.has_prefix(prefix) {
                continue;
            }
            if let Some(block) = inner.blocks.get(id) {
                infos.push(BlockInfo {
                    id: id.clone(),
                    timestamp: block.timestamp,
                    length: block.data.len() as u64,
                });
            }
        }
        Ok(infos)
    }

    fn delete_block(&self, id: &BlockId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.blocks.remove(id);
        inner.order.retain(|existing| existing != id);
        Ok(())
    }

    fn flush(&self, ctx: &CancelToken) -> anyhow::Result<()> {
        ctx.check()?;
        Ok(())
    }
}

/// One file per block under a flat root directory, named by block id.
/// Writes go through a temp file and rename; listing is sorted by id.
#[derive(Debug, Clone)]
pub struct LocalBlockStore {
    root: PathBuf,
}

impl LocalBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create block store root {}", root.display()))?;
        Ok(Self { root })
    }

    fn block_path(&self, id: &BlockId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl BlockStore for LocalBlockStore {
    fn write_block(
        &self,
        ctx: &CancelToken,
        data: &[u8],
        prefix: &str,
    ) -> anyhow::Result<BlockId> {
        ctx.check()?;
        let id = BlockId::from_content(prefix, data);
        let path = self.block_path(&id);
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(id)
    }

    fn get_block(&self, ctx: &CancelToken, id: &BlockId) -> anyhow::Result<Vec<u8>> {
        ctx.check()?;
        std::fs::read(self.block_path(id)).with_context(|| format!("read block {id}"))
    }

    fn list_blocks(&self, prefix: &str) -> anyhow::Result<Vec<BlockInfo>> {
        let mut infos = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Skip temp files left behind by interrupted writes.
            if !name.starts_with(prefix) || name.contains('.') {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            infos.push(BlockInfo {
                id: BlockId::new(name),
                timestamp: DateTime::<Utc>::from(metadata.modified()?),
                length: metadata.len(),
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    fn delete_block(&self, id: &BlockId) -> anyhow::Result<()> {
        let path = self.block_path(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn flush(&self, ctx: &CancelToken) -> anyhow::Result<()> {
        ctx.check()?;
        let dir = std::fs::File::open(&self.root)?;
        dir.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_is_content_addressed() -> anyhow::Result<()> {
        let ctx = CancelToken::new();
        let store = MemBlockStore::new();

        let a = store.write_block(&ctx, b"hello", "m")?;
        let b = store.write_block(&ctx, b"hello", "m")?;
        let c = store.write_block(&ctx, b"world", "m")?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.has_prefix("m"));

        // Re-writing identical content must not duplicate the listing.
        let listed = store.list_blocks("m")?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a);
        assert_eq!(listed[1].id, c);
        assert_eq!(listed[0].length, 5);

        store.delete_block(&a)?;
        assert_eq!(store.list_blocks("m")?.len(), 1);
        assert!(store.get_block(&ctx, &a).is_err());
        assert_eq!(store.get_block(&ctx, &c)?, b"world");
        Ok(())
    }

    #[test]
    fn mem_store_respects_cancellation() {
        let ctx = CancelToken::new();
        ctx.cancel();
        let store = MemBlockStore::new();
        assert!(store.write_block(&ctx, b"x", "m").is_err());
    }

    #[test]
    fn local_store_write_get_list_delete() -> anyhow::Result<()> {
        let ctx = CancelToken::new();
        let dir = tempfile::TempDir::new()?;
        let store = LocalBlockStore::new(dir.path())?;

        let a = store.write_block(&ctx, b"hello", "m")?;
        let b = store.write_block(&ctx, b"world", "m")?;
        assert_eq!(store.get_block(&ctx, &a)?, b"hello");

        let listed = store.list_blocks("m")?;
        assert_eq!(listed.len(), 2);
        let mut ids: Vec<_> = listed.iter().map(|info| info.id.clone()).collect();
        ids.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        store.delete_block(&a)?;
        store.delete_block(&a)?; // deleting twice is fine
        assert_eq!(store.list_blocks("m")?.len(), 1);
        store.flush(&ctx)?;
        Ok(())
    }
}
