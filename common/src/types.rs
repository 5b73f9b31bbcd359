//! Core chain types shared between the consensus core and its collaborators

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Block hash
pub type BlockHash = Hash<32>;

/// Transaction hash
pub type TxHash = Hash<32>;

/// An account address as the wallet layer encodes it
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a specific transaction output - the UTXO identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Anchor {
    /// Transaction that created the output
    pub tx_hash: TxHash,

    /// Output index within that transaction
    pub index: u32,
}

impl Anchor {
    pub fn new(tx_hash: TxHash, index: u32) -> Self {
        Self { tx_hash, index }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.index)
    }
}

/// Transaction input spending an anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Output being spent
    pub anchor: Anchor,

    /// Public key claimed to own the output
    pub public_key: Vec<u8>,

    /// Signature over the transaction, checked by the verifier
    pub signature: Vec<u8>,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: u64,
}

/// A transaction; the first transaction of a block is its reward transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxHash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,

    /// Fee declared by the sender; balance against inputs is checked by
    /// the transaction verifier
    pub fee: u64,
}

/// A finalized block
///
/// Immutable once constructed. `hash` is the proof hash over the contents
/// and `nonce`, produced externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub prev_hash: BlockHash,
    pub hash: BlockHash,

    /// Final timestamp, set when the proof was found (ms)
    pub timestamp: u64,

    /// Timestamp at which the validator assembled the candidate (ms)
    pub pos_timestamp: u64,

    pub difficulty: u32,
    pub legitimacy: u32,
    pub coin_base: u64,
    pub nonce: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Reward transaction, always first
    pub fn reward_transaction(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Everything except the reward transaction
    pub fn user_transactions(&self) -> &[Transaction] {
        self.transactions.get(1..).unwrap_or(&[])
    }

    /// Address of the validator (PoS) named by the reward transaction
    pub fn validator_address(&self) -> Option<&Address> {
        self.reward_transaction().and_then(|tx| tx.outputs.first()).map(|o| &o.address)
    }

    /// Total fees declared by the user transactions, `None` on overflow
    pub fn total_fees(&self) -> Option<u64> {
        self.user_transactions().iter().try_fold(0u64, |total, tx| total.checked_add(tx.fee))
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            index: self.index,
            hash: self.hash,
            prev_hash: self.prev_hash,
            timestamp: self.timestamp,
            legitimacy: self.legitimacy,
            validator: self.validator_address().cloned(),
            tx_count: self.transactions.len(),
        }
    }
}

/// Header summary handed to confirmation and candidate observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub timestamp: u64,
    pub legitimacy: u32,
    pub validator: Option<Address>,
    pub tx_count: usize,
}

/// Transport-level peer identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a peer reported about its chain at `observed_at` (ms)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub address: String,
    pub current_height: u64,
    pub latest_hash: BlockHash,
    pub observed_at: u64,
}

/// Read-only node status for the API layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub height: u64,
    pub tip: BlockHash,
    pub peer_count: usize,
    pub mempool_size: usize,
}
