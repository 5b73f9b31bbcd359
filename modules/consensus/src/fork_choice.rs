//! Fork choice: decide whether a cached branch beats the local chain and,
//! if so, how to switch to it.
//!
//! The local chain from the older of the two most recent snapshots up to
//! the tip is loaded into a [`ConsensusTree`], then every usable cached
//! block above that root is hung off it. Banned blocks and their
//! descendants are dropped from the cache, as are cached copies of blocks
//! we already hold. Blocks whose parent is still unknown stay cached; the
//! missing links may arrive later.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use meridian_common::{Block, BlockHash};
use tracing::{debug, info, warn};

use crate::consensus_tree::ConsensusTree;
use crate::finality_cache::FinalityCache;
use crate::interfaces::{ChainStore, SnapshotStore};
use crate::task::{DigestOptions, Task};
use crate::tree_block::BlockOrigin;
use crate::tree_error::ConsensusTreeError;

/// Steps that move the node from its current tip onto a better branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    /// Height of the last block shared by both chains
    pub fork_height: u64,
    /// Snapshot the state is restored to, at or below the fork
    pub rollback_height: u64,
    /// Canonical blocks between the snapshot and the fork, re-applied as-is
    pub replay: Vec<Block>,
    /// The winning branch above the fork, lowest first
    pub branch: Vec<Block>,
}

impl ReorgPlan {
    pub fn new_tip(&self) -> Option<&Block> {
        self.branch.last()
    }

    /// The plan as scheduler tasks, rollback first
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(1 + self.replay.len() + self.branch.len());
        tasks.push(Task::RollbackTo {
            height: self.rollback_height,
        });
        tasks.extend(
            self.replay
                .iter()
                .map(|block| Task::digest(block.clone(), DigestOptions::replay(), None)),
        );
        let last = self.branch.len().saturating_sub(1);
        tasks.extend(self.branch.iter().enumerate().map(|(i, block)| {
            Task::digest(
                block.clone(),
                DigestOptions::gossip().with_candidate(i == last),
                None,
            )
        }));
        tasks
    }
}

pub struct ForkChoiceEngine {
    chain_store: Arc<dyn ChainStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl ForkChoiceEngine {
    pub fn new(chain_store: Arc<dyn ChainStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            chain_store,
            snapshots,
        }
    }

    /// Look for a branch more legitimate than the local chain
    pub async fn evaluate(&self, cache: &mut FinalityCache) -> Result<Option<ReorgPlan>> {
        if cache.is_empty() {
            return Ok(None);
        }

        let tip = self.chain_store.last_block().await?;
        let mut snapshot_heights = self.snapshots.heights_available().await?;
        snapshot_heights.retain(|h| *h <= tip.index);
        snapshot_heights.sort_unstable_by(|a, b| b.cmp(a));

        // Branches may fork no lower than the older of the two newest snapshots
        let Some(&root_height) = snapshot_heights.iter().take(2).last() else {
            warn!(height = tip.index, "No snapshot at or below tip, skipping fork choice");
            return Ok(None);
        };

        let tree = self.build_tree(&tip, root_height, cache).await?;
        let favoured = tree.favoured_tip(Some(tip.hash));
        if favoured == tip.hash {
            debug!(height = tip.index, "Local chain is favoured");
            return Ok(None);
        }

        let fork = tree.find_common_ancestor(tip.hash, favoured)?;
        let fork_height = tree
            .get_block(&fork)
            .map(|b| b.number)
            .ok_or(ConsensusTreeError::BlockNotInTree { hash: fork })?;

        let branch = tree
            .collect_chain_from_ancestor(fork, favoured)
            .into_iter()
            .map(|hash| self.cached_branch_block(&tree, cache, hash))
            .collect::<Result<Vec<Block>>>()?;

        let rollback_height = snapshot_heights
            .iter()
            .copied()
            .find(|h| *h <= fork_height)
            .ok_or_else(|| anyhow!("No snapshot at or below fork height {fork_height}"))?;

        let mut replay = Vec::new();
        for height in rollback_height + 1..=fork_height {
            match self.chain_store.block_at(height).await? {
                Some(block) => replay.push(block),
                None => bail!("Canonical block {height} missing"),
            }
        }

        let plan = ReorgPlan {
            fork_height,
            rollback_height,
            replay,
            branch,
        };
        info!(
            fork = fork_height,
            rollback = rollback_height,
            from = tip.index,
            to = plan.new_tip().map(|b| b.index).unwrap_or(fork_height),
            "Better branch found"
        );
        Ok(Some(plan))
    }

    async fn build_tree(
        &self,
        tip: &Block,
        root_height: u64,
        cache: &mut FinalityCache,
    ) -> Result<ConsensusTree> {
        let root = self
            .chain_store
            .block_at(root_height)
            .await?
            .ok_or_else(|| anyhow!("Canonical block {root_height} missing"))?;
        let mut tree = ConsensusTree::new(&root);

        let mut canonical = vec![root.hash];
        for height in root_height + 1..=tip.index {
            let block = self
                .chain_store
                .block_at(height)
                .await?
                .ok_or_else(|| anyhow!("Canonical block {height} missing"))?;
            tree.insert(&block, BlockOrigin::Canonical)?;
            canonical.push(block.hash);
        }

        let mut dead: HashSet<BlockHash> = HashSet::new();
        let mut stale = Vec::new();
        for block in cache.blocks_above(root_height) {
            let is_canonical = block.index <= tip.index
                && canonical.get((block.index - root_height) as usize) == Some(&block.hash);
            if is_canonical {
                stale.push((block.index, block.hash));
                continue;
            }

            if cache.is_banned(&block.hash)
                || cache.is_banned(&block.prev_hash)
                || dead.contains(&block.prev_hash)
            {
                dead.insert(block.hash);
                stale.push((block.index, block.hash));
                continue;
            }

            match tree.insert(block, BlockOrigin::Cached) {
                Ok(()) => {}
                Err(ConsensusTreeError::ParentNotFound { .. }) => {
                    // Missing link, may still arrive
                }
                Err(e) => {
                    debug!(block = block.index, hash = %block.hash.short(), "Dropping cached block: {e}");
                    dead.insert(block.hash);
                    stale.push((block.index, block.hash));
                }
            }
        }

        for (height, hash) in stale {
            cache.remove(height, &hash);
        }

        Ok(tree)
    }

    fn cached_branch_block(
        &self,
        tree: &ConsensusTree,
        cache: &FinalityCache,
        hash: BlockHash,
    ) -> Result<Block> {
        let node = tree.get_block(&hash).ok_or(ConsensusTreeError::BlockNotInTree { hash })?;
        let number = node.number;
        if node.origin != BlockOrigin::Cached {
            bail!("Branch block {number} ({}) is already canonical", hash.short());
        }
        cache
            .get(number, &hash)
            .cloned()
            .ok_or_else(|| anyhow!("Branch block {number} ({}) not cached", hash.short()))
    }
}
