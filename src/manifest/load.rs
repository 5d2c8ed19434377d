//! Parallel fetch of manifest blocks during open.
//!
//! An ephemeral pool of worker threads pulls block ids from a bounded
//! channel, fetches and parses each block, and pushes the result back. The
//! pool size is a tuning knob, not a correctness parameter: results are
//! re-ordered to the caller's list order before they reach the merge, and
//! the first worker error fails the whole load.

use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use tracing::debug;

use crate::block::{BlockId, BlockStore};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::manifest::codec;
use crate::manifest::entry::ManifestEntry;

pub(super) fn load_blocks(
    ctx: &CancelToken,
    store: &dyn BlockStore,
    ids: &[BlockId],
    workers: usize,
) -> Result<Vec<Vec<ManifestEntry>>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let workers = workers.clamp(1, ids.len());
    let (id_tx, id_rx) = bounded(ids.len());
    let (result_tx, result_rx) = bounded(ids.len());

    thread::scope(|scope| {
        for worker_id in 0..workers {
            let id_rx = id_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for (index, block_id) in id_rx {
                    let started = Instant::now();
                    let result = fetch_block(ctx, store, &block_id);
                    debug!(
                        block = %block_id,
                        worker = worker_id,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        ok = result.is_ok(),
                        "manifest block loaded"
                    );
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (index, block_id) in ids.iter().enumerate() {
            if id_tx.send((index, block_id.clone())).is_err() {
                break;
            }
        }
        drop(id_tx);

        let mut loaded = Vec::with_capacity(ids.len());
        for (index, result) in result_rx {
            loaded.push((index, result?));
        }
        if loaded.len() != ids.len() {
            return Err(Error::Store(anyhow::anyhow!(
                "expected {} manifest blocks, loaded {}",
                ids.len(),
                loaded.len()
            )));
        }

        loaded.sort_by_key(|(index, _)| *index);
        Ok(loaded.into_iter().map(|(_, entries)| entries).collect())
    })
}

fn fetch_block(
    ctx: &CancelToken,
    store: &dyn BlockStore,
    id: &BlockId,
) -> Result<Vec<ManifestEntry>> {
    ctx.check()?;
    let data = store.get_block(ctx, id).map_err(Error::from_store)?;
    codec::decode(id, &data)
}
