//! Fork tree for choosing between competing chains.
//!
//! An arena of blocks keyed by hash with explicit parent/children links
//! and a per-node subtree score (the height of its highest descendant).
//! The favoured tip is found by walking down from the root, at each fork
//! taking the child whose subtree reaches highest. Equal subtrees are
//! ordered by the earlier timestamp of the first diverging block, then by
//! whether the branch holds the current tip.

use std::cmp::Ordering;
use std::collections::HashMap;

use meridian_common::{Block, BlockHash};
use tracing::debug;

use crate::tree_block::{BlockOrigin, TreeBlock};
use crate::tree_error::ConsensusTreeError;

/// All blocks between a snapshot root and the highest known branch tip.
///
/// Operations are single-threaded; the scheduler owns the only instance.
pub struct ConsensusTree {
    /// All blocks keyed by hash.
    blocks: HashMap<BlockHash, TreeBlock>,
    /// Root of the tree (the rollback floor).
    root: BlockHash,
}

impl ConsensusTree {
    /// Create a tree rooted at the given block. The root's own parent is
    /// irrelevant and not recorded.
    pub fn new(root: &Block) -> Self {
        let block = TreeBlock::new(
            root.hash,
            root.index,
            root.timestamp,
            None,
            BlockOrigin::Canonical,
        );
        let mut blocks = HashMap::new();
        blocks.insert(root.hash, block);
        Self {
            blocks,
            root: root.hash,
        }
    }

    pub fn root(&self) -> BlockHash {
        self.root
    }

    /// Returns a reference to the block with the given hash, if present.
    pub fn get_block(&self, hash: &BlockHash) -> Option<&TreeBlock> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Attach a block under its parent and update subtree scores.
    ///
    /// Inserting a block already in the tree is a no-op.
    pub fn insert(&mut self, block: &Block, origin: BlockOrigin) -> Result<(), ConsensusTreeError> {
        if self.blocks.contains_key(&block.hash) {
            return Ok(());
        }

        let parent = self
            .blocks
            .get_mut(&block.prev_hash)
            .ok_or(ConsensusTreeError::ParentNotFound {
                hash: block.prev_hash,
            })?;

        if block.index != parent.number + 1 {
            return Err(ConsensusTreeError::InvalidBlockNumber {
                expected: parent.number + 1,
                got: block.index,
            });
        }

        parent.children.push(block.hash);
        self.blocks.insert(block.hash, TreeBlock::from_block(block, origin));

        // Raise the subtree score of every ancestor this block now tops
        let mut current = Some(block.prev_hash);
        while let Some(h) = current {
            let Some(node) = self.blocks.get_mut(&h) else {
                break;
            };
            if node.best_height >= block.index {
                break;
            }
            node.best_height = block.index;
            current = node.parent;
        }

        Ok(())
    }

    /// Find the favoured tip.
    ///
    /// `current_tip` only matters when two branches have the same score and
    /// the same timestamp at their first diverging block.
    pub fn favoured_tip(&self, current_tip: Option<BlockHash>) -> BlockHash {
        let mut current = self.root;
        loop {
            let Some(block) = self.blocks.get(&current) else {
                return current;
            };

            let best = block
                .children
                .iter()
                .filter_map(|h| self.blocks.get(h))
                .max_by(|a, b| self.compare_branches(a, b, current_tip));

            match best {
                Some(child) => current = child.hash,
                None => return current,
            }
        }
    }

    /// Order two sibling branches; `Greater` means `a` is more legitimate.
    fn compare_branches(
        &self,
        a: &TreeBlock,
        b: &TreeBlock,
        current_tip: Option<BlockHash>,
    ) -> Ordering {
        let on_current = |block: &TreeBlock| {
            current_tip.is_some_and(|tip| self.chain_contains(block.hash, tip))
        };

        a.best_height
            .cmp(&b.best_height)
            // Earlier timestamp wins, so reverse
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| on_current(a).cmp(&on_current(b)))
            .then_with(|| b.hash.cmp(&a.hash))
    }

    /// Find the common ancestor of two blocks by walking back from both.
    pub fn find_common_ancestor(
        &self,
        a: BlockHash,
        b: BlockHash,
    ) -> Result<BlockHash, ConsensusTreeError> {
        let mut na = self.number_of(a)?;
        let mut nb = self.number_of(b)?;
        let mut ha = a;
        let mut hb = b;

        // Walk the higher block down to the same level
        while na > nb {
            ha = self.parent_of(ha)?;
            na -= 1;
        }
        while nb > na {
            hb = self.parent_of(hb)?;
            nb -= 1;
        }

        // Walk both up until they meet
        while ha != hb {
            ha = self.parent_of(ha)?;
            hb = self.parent_of(hb)?;
        }

        Ok(ha)
    }

    fn number_of(&self, hash: BlockHash) -> Result<u64, ConsensusTreeError> {
        self.blocks
            .get(&hash)
            .map(|b| b.number)
            .ok_or(ConsensusTreeError::BlockNotInTree { hash })
    }

    fn parent_of(&self, hash: BlockHash) -> Result<BlockHash, ConsensusTreeError> {
        self.blocks
            .get(&hash)
            .and_then(|b| b.parent)
            .ok_or(ConsensusTreeError::BlockNotInTree { hash })
    }

    /// Check if a block is on the chain ending at the given tip.
    pub fn chain_contains(&self, block_hash: BlockHash, tip: BlockHash) -> bool {
        let mut current = Some(tip);
        while let Some(h) = current {
            if h == block_hash {
                return true;
            }
            current = self.blocks.get(&h).and_then(|b| b.parent);
        }
        false
    }

    /// Collect block hashes on the chain from ancestor (exclusive) to tip
    /// (inclusive), in ascending order.
    pub fn collect_chain_from_ancestor(&self, ancestor: BlockHash, tip: BlockHash) -> Vec<BlockHash> {
        let mut chain = Vec::new();
        let mut current = Some(tip);
        while let Some(h) = current {
            if h == ancestor {
                break;
            }
            chain.push(h);
            current = self.blocks.get(&h).and_then(|b| b.parent);
        }
        chain.reverse();
        debug!(
            ancestor = %ancestor.short(),
            tip = %tip.short(),
            length = chain.len(),
            "Collected branch"
        );
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_test_utils::{chain_from, genesis, BlockBuilder};

    fn tree_with_root() -> (ConsensusTree, Block) {
        let root = genesis();
        (ConsensusTree::new(&root), root)
    }

    fn insert_all(tree: &mut ConsensusTree, blocks: &[Block], origin: BlockOrigin) {
        for block in blocks {
            tree.insert(block, origin).unwrap();
        }
    }

    #[test]
    fn new_tree_has_only_root() {
        let (tree, root) = tree_with_root();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root(), root.hash);
        assert_eq!(tree.favoured_tip(None), root.hash);
        assert!(tree.get_block(&root.hash).unwrap().parent.is_none());
    }

    #[test]
    fn insert_rejects_missing_parent() {
        let (mut tree, root) = tree_with_root();
        let orphan_parent = BlockBuilder::child_of(&root).tag(9).build();
        let orphan = BlockBuilder::child_of(&orphan_parent).build();

        let err = tree.insert(&orphan, BlockOrigin::Cached).unwrap_err();
        assert!(matches!(err, ConsensusTreeError::ParentNotFound { .. }));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn insert_rejects_wrong_number() {
        let (mut tree, root) = tree_with_root();
        let mut block = BlockBuilder::child_of(&root).build();
        block.index = 5;

        let err = tree.insert(&block, BlockOrigin::Cached).unwrap_err();
        assert!(matches!(
            err,
            ConsensusTreeError::InvalidBlockNumber { expected: 1, got: 5 }
        ));
    }

    #[test]
    fn insert_is_idempotent() {
        let (mut tree, root) = tree_with_root();
        let block = BlockBuilder::child_of(&root).build();
        tree.insert(&block, BlockOrigin::Canonical).unwrap();
        tree.insert(&block, BlockOrigin::Canonical).unwrap();

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get_block(&root.hash).unwrap().children.len(), 1);
    }

    #[test]
    fn subtree_scores_propagate_to_root() {
        let (mut tree, root) = tree_with_root();
        let main = chain_from(&root, 3, 0);
        insert_all(&mut tree, &main, BlockOrigin::Canonical);

        assert_eq!(tree.get_block(&root.hash).unwrap().best_height, 3);
        assert_eq!(tree.get_block(&main[0].hash).unwrap().best_height, 3);
        assert_eq!(tree.get_block(&main[2].hash).unwrap().best_height, 3);
    }

    #[test]
    fn favoured_tip_follows_longer_branch() {
        let (mut tree, root) = tree_with_root();
        let short = chain_from(&root, 2, 0);
        let long = chain_from(&root, 3, 1);
        insert_all(&mut tree, &short, BlockOrigin::Canonical);
        insert_all(&mut tree, &long, BlockOrigin::Cached);

        assert_eq!(tree.favoured_tip(Some(short[1].hash)), long[2].hash);
    }

    #[test]
    fn equal_branches_prefer_earlier_timestamp() {
        let (mut tree, root) = tree_with_root();
        let late = BlockBuilder::child_of(&root).tag(1).delayed_by(400).build();
        let early = BlockBuilder::child_of(&root).tag(2).build();
        tree.insert(&late, BlockOrigin::Canonical).unwrap();
        tree.insert(&early, BlockOrigin::Cached).unwrap();

        // Even though the late block is our current tip
        assert_eq!(tree.favoured_tip(Some(late.hash)), early.hash);
    }

    #[test]
    fn timestamp_compared_at_first_diverging_block() {
        let (mut tree, root) = tree_with_root();
        // Branch A diverges early, then has a late second block
        let a1 = BlockBuilder::child_of(&root).tag(1).build();
        let a2 = BlockBuilder::child_of(&a1).tag(1).delayed_by(5_000).build();
        // Branch B diverges later but its second block is earlier
        let b1 = BlockBuilder::child_of(&root).tag(2).delayed_by(100).build();
        let b2 = BlockBuilder::child_of(&b1).tag(2).build();
        insert_all(&mut tree, &[a1, a2.clone(), b1, b2], BlockOrigin::Cached);

        assert_eq!(tree.favoured_tip(None), a2.hash);
    }

    #[test]
    fn identical_timestamps_keep_current_tip() {
        let (mut tree, root) = tree_with_root();
        let ours = BlockBuilder::child_of(&root).tag(7).build();
        let theirs = BlockBuilder::child_of(&root).tag(3).build();
        tree.insert(&ours, BlockOrigin::Canonical).unwrap();
        tree.insert(&theirs, BlockOrigin::Cached).unwrap();

        assert_eq!(tree.favoured_tip(Some(ours.hash)), ours.hash);
        assert_eq!(tree.favoured_tip(Some(theirs.hash)), theirs.hash);
    }

    #[test]
    fn common_ancestor_of_diverging_tips() {
        let (mut tree, root) = tree_with_root();
        let trunk = chain_from(&root, 2, 0);
        let a = chain_from(&trunk[1], 2, 1);
        let b = chain_from(&trunk[1], 1, 2);
        insert_all(&mut tree, &trunk, BlockOrigin::Canonical);
        insert_all(&mut tree, &a, BlockOrigin::Canonical);
        insert_all(&mut tree, &b, BlockOrigin::Cached);

        let ancestor = tree.find_common_ancestor(a[1].hash, b[0].hash).unwrap();
        assert_eq!(ancestor, trunk[1].hash);
        assert_eq!(tree.find_common_ancestor(a[1].hash, a[0].hash).unwrap(), a[0].hash);
    }

    #[test]
    fn common_ancestor_requires_known_blocks() {
        let (tree, root) = tree_with_root();
        let stranger = BlockBuilder::child_of(&root).build();
        assert!(matches!(
            tree.find_common_ancestor(root.hash, stranger.hash),
            Err(ConsensusTreeError::BlockNotInTree { .. })
        ));
    }

    #[test]
    fn chain_contains_and_collect() {
        let (mut tree, root) = tree_with_root();
        let main = chain_from(&root, 3, 0);
        let fork = chain_from(&main[0], 1, 4);
        insert_all(&mut tree, &main, BlockOrigin::Canonical);
        insert_all(&mut tree, &fork, BlockOrigin::Cached);

        assert!(tree.chain_contains(main[0].hash, main[2].hash));
        assert!(tree.chain_contains(root.hash, main[2].hash));
        assert!(!tree.chain_contains(fork[0].hash, main[2].hash));

        let collected = tree.collect_chain_from_ancestor(root.hash, main[2].hash);
        let expected: Vec<BlockHash> = main.iter().map(|b| b.hash).collect();
        assert_eq!(collected, expected);
    }
}
