//! Error taxonomy for the consensus core.
//!
//! Digestion errors are classified by what the scheduler should do about
//! them rather than by which check failed.

use meridian_common::{Anchor, BlockHash};
use thiserror::Error;

/// What the scheduler does with a rejected block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestErrorKind {
    /// Far ahead of the tip: we are behind, request a sync
    OutOfRange,
    /// A few blocks ahead: cache it and see if a branch now wins
    StoreAndReorgCheck,
    /// Does not link to our tip: cache it and run fork choice
    StoreAndReorg,
    /// At or below our height: cache it in case of a late reorg
    Stale,
    /// Protocol violation: cache, ban the hash, penalize the sender
    Ban,
    /// Nonsensical but possibly our fault (clock skew): drop silently
    HardInvalid,
    /// A collaborator failed; nothing is known about the block itself
    Internal,
}

/// Errors produced by the validation pipeline
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("block {index} is too far ahead of local height {height}")]
    OutOfRange { index: u64, height: u64 },

    #[error("block {index} is ahead of local height {height}")]
    StoreAndReorgCheck { index: u64, height: u64 },

    #[error("block {index} links to {prev_hash}, local tip is {tip}")]
    StoreAndReorg {
        index: u64,
        prev_hash: BlockHash,
        tip: BlockHash,
    },

    #[error("block {index} is at or below local height {height}")]
    Stale { index: u64, height: u64 },

    #[error("block {index} violates consensus rules: {reason}")]
    Ban { index: u64, reason: String },

    #[error("block {index} rejected: {reason}")]
    HardInvalid { index: u64, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DigestError {
    pub fn kind(&self) -> DigestErrorKind {
        match self {
            DigestError::OutOfRange { .. } => DigestErrorKind::OutOfRange,
            DigestError::StoreAndReorgCheck { .. } => DigestErrorKind::StoreAndReorgCheck,
            DigestError::StoreAndReorg { .. } => DigestErrorKind::StoreAndReorg,
            DigestError::Stale { .. } => DigestErrorKind::Stale,
            DigestError::Ban { .. } => DigestErrorKind::Ban,
            DigestError::HardInvalid { .. } => DigestErrorKind::HardInvalid,
            DigestError::Internal(_) => DigestErrorKind::Internal,
        }
    }

    pub(crate) fn ban(index: u64, reason: impl Into<String>) -> Self {
        DigestError::Ban {
            index,
            reason: reason.into(),
        }
    }

    pub(crate) fn hard_invalid(index: u64, reason: impl Into<String>) -> Self {
        DigestError::HardInvalid {
            index,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by mempool admission
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    DuplicateTransaction,

    #[error("transaction spends {0}, already spent by a pooled transaction")]
    ConflictingUtxo(Anchor),

    #[error("anchor {0} not found")]
    AnchorNotFound(Anchor),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MempoolError {
    /// Errors that are expected under normal gossip and not worth reporting
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            MempoolError::DuplicateTransaction | MempoolError::ConflictingUtxo(_)
        )
    }
}

/// Terminal sync failure; the node must restart
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no peer could be synced from ({attempted} attempted)")]
    AllPeersFailed { attempted: usize },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
