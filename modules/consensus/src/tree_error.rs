//! Error types for fork tree operations.

use meridian_common::BlockHash;

/// Errors returned by [`ConsensusTree`](crate::consensus_tree::ConsensusTree) operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusTreeError {
    /// The block's parent hash is not present in the tree.
    #[error("parent not found: {hash}")]
    ParentNotFound { hash: BlockHash },

    /// The block's number does not equal parent number + 1.
    #[error("invalid block number: expected {expected}, got {got}")]
    InvalidBlockNumber { expected: u64, got: u64 },

    /// A block hash referenced by an operation is not in the tree.
    #[error("block not in tree: {hash}")]
    BlockNotInTree { hash: BlockHash },
}
