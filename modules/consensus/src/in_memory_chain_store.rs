//! In-memory canonical chain store

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use meridian_common::Block;
use tokio::sync::RwLock;
use tracing::info;

use crate::interfaces::ChainStore;

pub struct InMemoryChainStore {
    /// Blocks indexed by height, genesis first
    blocks: RwLock<Vec<Block>>,
}

impl InMemoryChainStore {
    pub fn new(genesis: Block) -> Self {
        info!(hash = %genesis.hash.short(), "Storing chain in memory");

        Self {
            blocks: RwLock::new(vec![genesis]),
        }
    }
}

#[async_trait]
impl ChainStore for InMemoryChainStore {
    async fn height(&self) -> Result<u64> {
        let blocks = self.blocks.read().await;
        Ok(blocks.len().saturating_sub(1) as u64)
    }

    async fn last_block(&self) -> Result<Block> {
        self.blocks.read().await.last().cloned().ok_or_else(|| anyhow!("Chain is empty"))
    }

    async fn block_at(&self, height: u64) -> Result<Option<Block>> {
        let index = usize::try_from(height)?;
        Ok(self.blocks.read().await.get(index).cloned())
    }

    /// Persistence is a no-op here
    async fn put_block(&self, block: &Block, _persist: bool) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        let Some(tip) = blocks.last() else {
            bail!("Chain is empty");
        };
        if block.index != tip.index + 1 || block.prev_hash != tip.hash {
            bail!(
                "Block {} ({}) does not extend tip {} ({})",
                block.index,
                block.hash.short(),
                tip.index,
                tip.hash.short()
            );
        }
        blocks.push(block.clone());
        Ok(())
    }

    async fn erase_above(&self, height: u64) -> Result<Vec<Block>> {
        let keep = usize::try_from(height)?.saturating_add(1);
        let mut blocks = self.blocks.write().await;
        if keep >= blocks.len() {
            return Ok(Vec::new());
        }
        Ok(blocks.split_off(keep))
    }
}
