//! Collaborators the consensus core consumes.
//!
//! Everything here is owned elsewhere: storage engines, the UTXO set and
//! mempool, cryptography, snapshots and the peer transport. Methods take
//! `&self`; implementations use interior mutability. The core guarantees
//! that only the scheduler's drain loop calls the mutating ones.

use anyhow::Result;
use async_trait::async_trait;
use meridian_common::{
    Address, Anchor, Block, BlockHash, PeerId, PeerStatus, Transaction, TxOutput,
};

use crate::errors::MempoolError;

/// Canonical chain storage
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Height of the tip
    async fn height(&self) -> Result<u64>;

    /// The tip block
    async fn last_block(&self) -> Result<Block>;

    /// Canonical block at `height`
    async fn block_at(&self, height: u64) -> Result<Option<Block>>;

    /// Append a block on top of the tip, optionally flushing it to disk
    async fn put_block(&self, block: &Block, persist: bool) -> Result<()>;

    /// Remove every block above `height`, returning them lowest first
    async fn erase_above(&self, height: u64) -> Result<Vec<Block>>;
}

/// UTXO set and mempool
#[async_trait]
pub trait UtxoStore: Send + Sync {
    /// Spend inputs and create outputs of every transaction in the block
    async fn apply_block(&self, block: &Block) -> Result<()>;

    /// Admit a transaction to the mempool
    async fn push_transaction(&self, tx: &Transaction) -> Result<(), MempoolError>;

    /// Drop pooled transactions included in, or conflicting with, the block
    async fn prune_for_block(&self, block: &Block) -> Result<()>;

    /// Look up a live output
    async fn get_utxo(&self, anchor: &Anchor) -> Result<Option<TxOutput>>;

    /// Record public key / address pairs seen while verifying a block
    async fn merge_known_addresses(&self, discovered: Vec<DiscoveredAddress>) -> Result<()>;

    /// Number of pooled transactions
    async fn mempool_size(&self) -> usize;
}

/// Stake-weighted legitimacy ranking
#[async_trait]
pub trait StakeTable: Send + Sync {
    /// Legitimacy rank `address` holds in the round seeded by `round_seed`,
    /// or `None` if it is not eligible at all
    async fn legitimacy_for(&self, address: &Address, round_seed: &BlockHash)
        -> Result<Option<u32>>;

    /// Apply stake changes carried by the block
    async fn apply_block(&self, block: &Block) -> Result<()>;
}

/// A public key observed spending from an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub public_key: Vec<u8>,
    pub address: Address,
}

/// Outcome of full transaction verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionVerdict {
    Valid { discovered: Vec<DiscoveredAddress> },
    Invalid { reason: String },
}

/// Hashing and signature verification
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Recompute the proof hash from the block contents and nonce
    async fn proof_hash(&self, block: &Block) -> Result<BlockHash>;

    /// Difficulty the chain expects of a child of `parent`, before the
    /// legitimacy and time adjustments
    async fn base_difficulty(&self, parent: &Block) -> Result<u32>;

    /// Signature, script and anchor checks for every transaction
    async fn verify_transactions(&self, block: &Block) -> Result<TransactionVerdict>;
}

/// Persisted state snapshots used as rollback points
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Heights with a usable snapshot, any order
    async fn heights_available(&self) -> Result<Vec<u64>>;

    /// Restore UTXO, stake and mempool-index state to `height`
    async fn rollback_to(&self, height: u64) -> Result<()>;

    /// Take a snapshot of the current state, labelled `height`
    async fn snapshot_at(&self, height: u64) -> Result<()>;

    /// Discard snapshots above `height`
    async fn erase_above(&self, height: u64) -> Result<()>;
}

/// Peer transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Currently connected peers
    async fn peers(&self) -> Vec<PeerId>;

    /// Gossip a block on a topic
    async fn broadcast(&self, topic: &str, block: &Block) -> Result<()>;

    /// Blocks `from..=to` from one peer
    async fn request_blocks(&self, peer: &PeerId, from: u64, to: u64) -> Result<Vec<Block>>;

    async fn peer_status(&self, peer: &PeerId) -> Result<PeerStatus>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

/// Offences reported to the reputation service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Offense {
    /// Sent a block violating consensus rules
    InvalidBlock,
    /// Served a sync batch that did not validate
    InvalidSyncBatch,
}

/// Reputation service, fire-and-forget
pub trait Reputation: Send + Sync {
    fn apply_offense(&self, peer: &PeerId, offense: Offense);
}

/// The local validator role
#[async_trait]
pub trait ValidatorRole: Send + Sync {
    /// Assemble the next candidate on top of `tip`; `None` if this node is
    /// not eligible this round
    async fn create_candidate(&self, tip: &Block) -> Result<Option<Block>>;
}

/// Network-synchronized wall clock
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Clock backed by the system time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
    }
}
