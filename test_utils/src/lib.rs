//! Block and transaction builders for Meridian tests
//!
//! Hashes produced here are synthetic: they encode height, parent and a
//! branch tag so that distinct branches never collide. Tests pair them with
//! a proof verifier that echoes `block.hash` back.

use meridian_common::{
    calculations::{block_reward, reward_split},
    Address, Anchor, Block, BlockHash, Transaction, TxHash, TxInput, TxOutput,
};

/// Reward parameters matching the consensus module's default configuration
pub const INITIAL_REWARD: u64 = 1_000;
pub const HALVING_INTERVAL: u64 = 1_000_000;
pub const POS_REWARD_PERCENT: u8 = 50;

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000_000;
pub const BLOCK_SPACING_MS: u64 = 1_500;

/// A hash whose first byte is `n`, for hand-built fixtures
pub fn hash(n: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    BlockHash::from(bytes)
}

/// A transaction hash whose last byte is `n`
pub fn tx_hash(n: u8) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[31] = n;
    TxHash::from(bytes)
}

pub fn address(name: &str) -> Address {
    Address::new(name)
}

pub fn genesis() -> Block {
    Block {
        index: 0,
        prev_hash: BlockHash::default(),
        hash: synthetic_hash(0, &BlockHash::default(), 0),
        timestamp: GENESIS_TIMESTAMP,
        pos_timestamp: GENESIS_TIMESTAMP,
        difficulty: 0,
        legitimacy: 0,
        coin_base: 0,
        nonce: 0,
        transactions: Vec::new(),
    }
}

/// A user transaction spending `inputs` with the given fee
pub fn transaction(id: u8, inputs: &[Anchor], fee: u64) -> Transaction {
    Transaction {
        id: tx_hash(id),
        inputs: inputs
            .iter()
            .map(|anchor| TxInput {
                anchor: *anchor,
                public_key: vec![id],
                signature: vec![id, id],
            })
            .collect(),
        outputs: vec![TxOutput {
            address: address("recipient"),
            amount: 10,
        }],
        fee,
    }
}

fn synthetic_hash(index: u64, prev: &BlockHash, tag: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&index.to_be_bytes());
    bytes[8] = tag;
    bytes[9..25].copy_from_slice(&prev[..16]);
    // Never all-zero so it cannot be mistaken for the default hash
    bytes[31] = 0xaa;
    BlockHash::from(bytes)
}

/// Builds a valid child of a parent block
pub struct BlockBuilder {
    parent_index: u64,
    prev_hash: BlockHash,
    parent_timestamp: u64,
    tag: u8,
    timestamp_offset: u64,
    validator: Address,
    miner: Address,
    legitimacy: u32,
    difficulty: u32,
    transactions: Vec<Transaction>,
    coin_base: Option<u64>,
}

impl BlockBuilder {
    pub fn child_of(parent: &Block) -> Self {
        Self {
            parent_index: parent.index,
            prev_hash: parent.hash,
            parent_timestamp: parent.timestamp,
            tag: 0,
            timestamp_offset: 0,
            validator: address("validator"),
            miner: address("miner"),
            legitimacy: 0,
            difficulty: 0,
            transactions: Vec::new(),
            coin_base: None,
        }
    }

    /// Distinguishes sibling branches built on the same parent
    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    /// Shift the block's timestamps later by `ms`
    pub fn delayed_by(mut self, ms: u64) -> Self {
        self.timestamp_offset = ms;
        self
    }

    pub fn validator(mut self, validator: &str) -> Self {
        self.validator = address(validator);
        self
    }

    pub fn legitimacy(mut self, legitimacy: u32) -> Self {
        self.legitimacy = legitimacy;
        self
    }

    pub fn difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_transaction(mut self, tx: Transaction) -> Self {
        self.transactions.push(tx);
        self
    }

    /// Override the coinbase, leaving the reward outputs computed from the
    /// correct schedule value
    pub fn coin_base(mut self, coin_base: u64) -> Self {
        self.coin_base = Some(coin_base);
        self
    }

    pub fn build(self) -> Block {
        let index = self.parent_index + 1;
        let scheduled = block_reward(self.parent_index, INITIAL_REWARD, HALVING_INTERVAL);
        // Overflowing fees leave a zero reward; such blocks are only built to be rejected
        let (pos_reward, pow_reward) = self
            .transactions
            .iter()
            .try_fold(0u64, |total, tx| total.checked_add(tx.fee))
            .and_then(|fees| reward_split(scheduled, fees, POS_REWARD_PERCENT))
            .unwrap_or_default();

        let mut reward_id = [0u8; 32];
        reward_id[..8].copy_from_slice(&index.to_be_bytes());
        reward_id[8] = self.tag;
        reward_id[9] = 0xee;
        let reward = Transaction {
            id: TxHash::from(reward_id),
            inputs: Vec::new(),
            outputs: vec![
                TxOutput {
                    address: self.validator,
                    amount: pos_reward,
                },
                TxOutput {
                    address: self.miner,
                    amount: pow_reward,
                },
            ],
            fee: 0,
        };

        let pos_timestamp = self.parent_timestamp + BLOCK_SPACING_MS + self.timestamp_offset;
        let mut transactions = vec![reward];
        transactions.extend(self.transactions);

        Block {
            index,
            prev_hash: self.prev_hash,
            hash: synthetic_hash(index, &self.prev_hash, self.tag),
            timestamp: pos_timestamp + BLOCK_SPACING_MS / 3,
            pos_timestamp,
            difficulty: self.difficulty,
            legitimacy: self.legitimacy,
            coin_base: self.coin_base.unwrap_or(scheduled),
            nonce: u64::from(self.tag),
            transactions,
        }
    }
}

/// `count` consecutive valid blocks on top of `parent`, all with `tag`
pub fn chain_from(parent: &Block, count: usize, tag: u8) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    for _ in 0..count {
        let tip = blocks.last().unwrap_or(parent);
        let block = BlockBuilder::child_of(tip).tag(tag).build();
        blocks.push(block);
    }
    blocks
}
