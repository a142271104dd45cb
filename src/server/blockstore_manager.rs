use ahash::AHashMap;
use anyhow::Result;
use cid::Cid;
use futures::{stream, StreamExt, TryStreamExt};

use crate::{block::Block, Store};

/// Maximum number of concurrent requests to the store per call.
const STORE_CONCURRENCY: usize = 16;

/// Batches lookups against the blockstore.
#[derive(Debug)]
pub struct BlockstoreManager<S: Store> {
    store: S,
}

impl<S: Store> BlockstoreManager<S> {
    pub fn new(store: S) -> Self {
        BlockstoreManager { store }
    }

    /// Returns the sizes of the blocks that are in the store. Missing blocks are left out.
    pub async fn get_block_sizes(&self, keys: &[Cid]) -> Result<AHashMap<Cid, usize>> {
        if keys.is_empty() {
            return Ok(AHashMap::new());
        }

        let sizes: Vec<_> = stream::iter(keys.iter().copied())
            .map(|cid| async move { self.store.get_size(&cid).await.map(|size| (cid, size)) })
            .buffer_unordered(STORE_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(sizes
            .into_iter()
            .filter_map(|(cid, size)| size.map(|size| (cid, size)))
            .collect())
    }

    /// Returns the blocks that are in the store. Missing blocks are left out.
    pub async fn get_blocks(&self, keys: &[Cid]) -> Result<AHashMap<Cid, Block>> {
        if keys.is_empty() {
            return Ok(AHashMap::new());
        }

        let blocks: Vec<_> = stream::iter(keys.iter().copied())
            .map(|cid| async move { self.store.get(&cid).await })
            .buffer_unordered(STORE_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(blocks
            .into_iter()
            .flatten()
            .map(|block| (block.cid, block))
            .collect())
    }
}
