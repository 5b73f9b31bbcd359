//! Units of work executed by the scheduler's drain loop

use meridian_common::{Block, PeerId, Transaction};

/// How a block should be digested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestOptions {
    /// Trust the block and skip consensus checks (replay of known history)
    pub skip_validation: bool,
    /// Schedule a candidate on top of the block once accepted
    pub broadcast_new_candidate: bool,
    /// Arrived through the sync protocol rather than gossip
    pub is_sync: bool,
    pub persist_to_disk: bool,
}

impl DigestOptions {
    /// A finalized block received over gossip
    pub fn gossip() -> Self {
        Self {
            skip_validation: false,
            broadcast_new_candidate: true,
            is_sync: false,
            persist_to_disk: true,
        }
    }

    /// A block fetched from a peer during sync
    pub fn sync() -> Self {
        Self {
            skip_validation: false,
            broadcast_new_candidate: false,
            is_sync: true,
            persist_to_disk: true,
        }
    }

    /// Re-application of a block this node already accepted once
    pub fn replay() -> Self {
        Self {
            skip_validation: true,
            broadcast_new_candidate: false,
            is_sync: false,
            persist_to_disk: true,
        }
    }

    pub fn with_candidate(mut self, broadcast_new_candidate: bool) -> Self {
        self.broadcast_new_candidate = broadcast_new_candidate;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Task {
    PushTransaction(Transaction),
    DigestBlock {
        block: Box<Block>,
        options: DigestOptions,
        /// Peer the block came from, if any, for offence reporting
        source: Option<PeerId>,
    },
    SyncWithPeers,
    CreateCandidate,
    RollbackTo {
        height: u64,
    },
    ReorgStart,
    ReorgEnd,
    /// Evaluate fork choice and queue a plan if a better branch exists
    CheckReorg,
}

impl Task {
    pub fn digest(block: Block, options: DigestOptions, source: Option<PeerId>) -> Self {
        Task::DigestBlock {
            block: Box::new(block),
            options,
            source,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::PushTransaction(_) => "push_transaction",
            Task::DigestBlock { .. } => "digest_block",
            Task::SyncWithPeers => "sync_with_peers",
            Task::CreateCandidate => "create_candidate",
            Task::RollbackTo { .. } => "rollback_to",
            Task::ReorgStart => "reorg_start",
            Task::ReorgEnd => "reorg_end",
            Task::CheckReorg => "check_reorg",
        }
    }
}

/// Where a task is inserted into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Front,
}
