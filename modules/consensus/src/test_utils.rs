//! In-memory collaborators for consensus tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use meridian_common::{
    Address, Anchor, Block, BlockHash, BlockHeader, PeerId, PeerStatus, Transaction, TxHash,
    TxOutput,
};
use meridian_test_utils::{genesis, BlockBuilder, GENESIS_TIMESTAMP};

use crate::configuration::ConsensusConfig;
use crate::errors::MempoolError;
use crate::fork_choice::ForkChoiceEngine;
use crate::in_memory_chain_store::InMemoryChainStore;
use crate::interfaces::{
    Clock, DiscoveredAddress, Offense, PeerTransport, ProofVerifier, Reputation, SnapshotStore,
    StakeTable, TransactionVerdict, UtxoStore, ValidatorRole,
};
use crate::observer::ConsensusObserver;
use crate::scheduler::Scheduler;
use crate::sync::{PeerBook, SyncProtocol};
use crate::validation::ValidationPipeline;
use crate::{Collaborators, ConsensusCore};

#[derive(Debug, Clone, Default)]
pub struct UtxoState {
    pub utxos: HashMap<Anchor, TxOutput>,
    pub mempool: HashMap<TxHash, Transaction>,
    pub known: Vec<DiscoveredAddress>,
    pub applied: Vec<u64>,
}

#[derive(Default)]
pub struct FakeUtxo {
    state: Mutex<UtxoState>,
}

impl FakeUtxo {
    pub fn fund(&self, anchor: Anchor, output: TxOutput) {
        self.state.lock().unwrap().utxos.insert(anchor, output);
    }

    pub fn applied(&self) -> Vec<u64> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn known_addresses(&self) -> Vec<DiscoveredAddress> {
        self.state.lock().unwrap().known.clone()
    }

    fn capture(&self) -> UtxoState {
        self.state.lock().unwrap().clone()
    }

    fn restore(&self, state: UtxoState) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl UtxoStore for FakeUtxo {
    async fn apply_block(&self, block: &Block) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for tx in &block.transactions {
            for input in &tx.inputs {
                state.utxos.remove(&input.anchor);
            }
            for (i, output) in tx.outputs.iter().enumerate() {
                state.utxos.insert(Anchor::new(tx.id, i as u32), output.clone());
            }
        }
        state.applied.push(block.index);
        Ok(())
    }

    async fn push_transaction(&self, tx: &Transaction) -> Result<(), MempoolError> {
        let mut state = self.state.lock().unwrap();
        if state.mempool.contains_key(&tx.id) {
            return Err(MempoolError::DuplicateTransaction);
        }
        for input in &tx.inputs {
            let spent = state
                .mempool
                .values()
                .any(|pooled| pooled.inputs.iter().any(|i| i.anchor == input.anchor));
            if spent {
                return Err(MempoolError::ConflictingUtxo(input.anchor));
            }
            if !state.utxos.contains_key(&input.anchor) {
                return Err(MempoolError::AnchorNotFound(input.anchor));
            }
        }
        state.mempool.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn prune_for_block(&self, block: &Block) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let included: HashSet<TxHash> = block.transactions.iter().map(|tx| tx.id).collect();
        let spent: HashSet<Anchor> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.inputs.iter().map(|i| i.anchor))
            .collect();
        state.mempool.retain(|id, tx| {
            !included.contains(id) && !tx.inputs.iter().any(|i| spent.contains(&i.anchor))
        });
        Ok(())
    }

    async fn get_utxo(&self, anchor: &Anchor) -> Result<Option<TxOutput>> {
        Ok(self.state.lock().unwrap().utxos.get(anchor).cloned())
    }

    async fn merge_known_addresses(&self, discovered: Vec<DiscoveredAddress>) -> Result<()> {
        self.state.lock().unwrap().known.extend(discovered);
        Ok(())
    }

    async fn mempool_size(&self) -> usize {
        self.state.lock().unwrap().mempool.len()
    }
}

/// Snapshots of a [`FakeUtxo`], starting with one at genesis
pub struct FakeSnapshots {
    utxo: Arc<FakeUtxo>,
    snapshots: Mutex<BTreeMap<u64, UtxoState>>,
    failing: Mutex<bool>,
}

impl FakeSnapshots {
    pub fn new(utxo: Arc<FakeUtxo>) -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, utxo.capture());
        Self {
            utxo,
            snapshots: Mutex::new(snapshots),
            failing: Mutex::new(false),
        }
    }

    /// Make every later `snapshot_at` fail
    pub fn fail_snapshots(&self) {
        *self.failing.lock().unwrap() = true;
    }
}

#[async_trait]
impl SnapshotStore for FakeSnapshots {
    async fn heights_available(&self) -> Result<Vec<u64>> {
        Ok(self.snapshots.lock().unwrap().keys().copied().collect())
    }

    async fn rollback_to(&self, height: u64) -> Result<()> {
        let state = self
            .snapshots
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| anyhow!("no snapshot at {height}"))?;
        self.utxo.restore(state);
        Ok(())
    }

    async fn snapshot_at(&self, height: u64) -> Result<()> {
        if *self.failing.lock().unwrap() {
            bail!("snapshot disk full");
        }
        let state = self.utxo.capture();
        self.snapshots.lock().unwrap().insert(height, state);
        Ok(())
    }

    async fn erase_above(&self, height: u64) -> Result<()> {
        self.snapshots.lock().unwrap().retain(|h, _| *h <= height);
        Ok(())
    }
}

/// Every address holds legitimacy 0 unless told otherwise
#[derive(Default)]
pub struct FakeStake {
    ranks: Mutex<HashMap<Address, u32>>,
    excluded: Mutex<HashSet<Address>>,
    applied: Mutex<Vec<u64>>,
}

impl FakeStake {
    pub fn set_rank(&self, address: &Address, rank: u32) {
        self.ranks.lock().unwrap().insert(address.clone(), rank);
    }

    pub fn exclude(&self, address: &Address) {
        self.excluded.lock().unwrap().insert(address.clone());
    }

    pub fn applied(&self) -> Vec<u64> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl StakeTable for FakeStake {
    async fn legitimacy_for(&self, address: &Address, _round_seed: &BlockHash) -> Result<Option<u32>> {
        if self.excluded.lock().unwrap().contains(address) {
            return Ok(None);
        }
        Ok(Some(self.ranks.lock().unwrap().get(address).copied().unwrap_or(0)))
    }

    async fn apply_block(&self, block: &Block) -> Result<()> {
        self.applied.lock().unwrap().push(block.index);
        Ok(())
    }
}

/// Treats every block hash as a correct proof unless forged
#[derive(Default)]
pub struct EchoVerifier {
    forged: Mutex<HashSet<BlockHash>>,
    rejected: Mutex<HashSet<BlockHash>>,
    base_difficulty: Mutex<Option<u32>>,
}

impl EchoVerifier {
    /// Expected difficulty for every block; defaults to the parent's
    pub fn set_base_difficulty(&self, difficulty: u32) {
        *self.base_difficulty.lock().unwrap() = Some(difficulty);
    }

    pub fn forge(&self, hash: BlockHash) {
        self.forged.lock().unwrap().insert(hash);
    }

    pub fn reject(&self, hash: BlockHash) {
        self.rejected.lock().unwrap().insert(hash);
    }
}

#[async_trait]
impl ProofVerifier for EchoVerifier {
    async fn proof_hash(&self, block: &Block) -> Result<BlockHash> {
        if self.forged.lock().unwrap().contains(&block.hash) {
            Ok(BlockHash::default())
        } else {
            Ok(block.hash)
        }
    }

    async fn base_difficulty(&self, parent: &Block) -> Result<u32> {
        Ok(self.base_difficulty.lock().unwrap().unwrap_or(parent.difficulty))
    }

    async fn verify_transactions(&self, block: &Block) -> Result<TransactionVerdict> {
        if self.rejected.lock().unwrap().contains(&block.hash) {
            return Ok(TransactionVerdict::Invalid {
                reason: "bad signature".to_string(),
            });
        }
        let discovered = block
            .user_transactions()
            .iter()
            .flat_map(|tx| &tx.inputs)
            .map(|input| DiscoveredAddress {
                public_key: input.public_key.clone(),
                address: Address::new(format!("owner-{:?}", input.public_key)),
            })
            .collect();
        Ok(TransactionVerdict::Valid { discovered })
    }
}

struct FakePeer {
    chain: Vec<Block>,
    unresponsive: bool,
    failing_height: Option<u64>,
    growth: Vec<Block>,
    status_calls: usize,
}

/// Peers serving fixed chains, genesis first
#[derive(Default)]
pub struct FakeTransport {
    peers: Mutex<BTreeMap<PeerId, FakePeer>>,
    requests: Mutex<Vec<(PeerId, u64, u64)>>,
    subscriptions: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<(String, BlockHash)>>,
}

impl FakeTransport {
    fn insert(&self, name: &str, peer: FakePeer) {
        self.peers.lock().unwrap().insert(PeerId::new(name), peer);
    }

    pub fn add_peer(&self, name: &str, chain: Vec<Block>) {
        self.insert(
            name,
            FakePeer {
                chain,
                unresponsive: false,
                failing_height: None,
                growth: Vec::new(),
                status_calls: 0,
            },
        );
    }

    /// A peer that never answers status queries
    pub fn add_unresponsive_peer(&self, name: &str) {
        self.insert(
            name,
            FakePeer {
                chain: vec![genesis()],
                unresponsive: true,
                failing_height: None,
                growth: Vec::new(),
                status_calls: 0,
            },
        );
    }

    /// A peer that claims `height` but fails every block request
    pub fn add_failing_peer(&self, name: &str, height: u64) {
        self.insert(
            name,
            FakePeer {
                chain: vec![genesis()],
                unresponsive: false,
                failing_height: Some(height),
                growth: Vec::new(),
                status_calls: 0,
            },
        );
    }

    /// Blocks the peer gains after its first status report
    pub fn extend_on_status(&self, name: &str, blocks: Vec<Block>) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(&PeerId::new(name)) {
            peer.growth = blocks;
        }
    }

    pub fn requests(&self) -> Vec<(PeerId, u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn subscription_log(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<(String, BlockHash)> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    async fn broadcast(&self, topic: &str, block: &Block) -> Result<()> {
        self.broadcasts.lock().unwrap().push((topic.to_string(), block.hash));
        Ok(())
    }

    async fn request_blocks(&self, peer: &PeerId, from: u64, to: u64) -> Result<Vec<Block>> {
        self.requests.lock().unwrap().push((peer.clone(), from, to));
        let peers = self.peers.lock().unwrap();
        let Some(fake) = peers.get(peer) else {
            bail!("unknown peer {peer}");
        };
        if fake.failing_height.is_some() {
            bail!("connection reset by {peer}");
        }
        Ok(fake
            .chain
            .iter()
            .filter(|b| b.index >= from && b.index <= to)
            .cloned()
            .collect())
    }

    async fn peer_status(&self, peer: &PeerId) -> Result<PeerStatus> {
        let status = {
            let mut peers = self.peers.lock().unwrap();
            let Some(fake) = peers.get_mut(peer) else {
                bail!("unknown peer {peer}");
            };
            if fake.unresponsive {
                None
            } else {
                if fake.status_calls > 0 && !fake.growth.is_empty() {
                    let growth = std::mem::take(&mut fake.growth);
                    fake.chain.extend(growth);
                }
                fake.status_calls += 1;
                let tip = fake.chain.last().cloned().unwrap_or_else(genesis);
                Some(PeerStatus {
                    peer_id: peer.clone(),
                    address: format!("{peer}.local:7000"),
                    current_height: fake.failing_height.unwrap_or(tip.index),
                    latest_hash: tip.hash,
                    observed_at: GENESIS_TIMESTAMP,
                })
            }
        };
        match status {
            Some(status) => Ok(status),
            None => std::future::pending().await,
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().unwrap().push(format!("+{topic}"));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().unwrap().push(format!("-{topic}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReputation {
    offenses: Mutex<Vec<(PeerId, Offense)>>,
}

impl RecordingReputation {
    pub fn offenses(&self) -> Vec<(PeerId, Offense)> {
        self.offenses.lock().unwrap().clone()
    }
}

impl Reputation for RecordingReputation {
    fn apply_offense(&self, peer: &PeerId, offense: Offense) {
        self.offenses.lock().unwrap().push((peer.clone(), offense));
    }
}

/// Builds a candidate on every request, recording the tip height
#[derive(Default)]
pub struct FakeValidator {
    created: Mutex<Vec<u64>>,
}

impl FakeValidator {
    pub fn created(&self) -> Vec<u64> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ValidatorRole for FakeValidator {
    async fn create_candidate(&self, tip: &Block) -> Result<Option<Block>> {
        self.created.lock().unwrap().push(tip.index);
        Ok(Some(BlockBuilder::child_of(tip).validator("local").tag(0xcc).build()))
    }
}

pub struct FixedClock {
    now: Mutex<u64>,
}

impl Default for FixedClock {
    fn default() -> Self {
        // Comfortably after every fixture block
        Self {
            now: Mutex::new(GENESIS_TIMESTAMP + 10 * 24 * 3_600_000),
        }
    }
}

impl FixedClock {
    pub fn set(&self, now: u64) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    confirmed: Mutex<Vec<u64>>,
    candidates: Mutex<Vec<u64>>,
    rollbacks: Mutex<Vec<u64>>,
}

impl RecordingObserver {
    pub fn confirmed(&self) -> Vec<u64> {
        self.confirmed.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<u64> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn rollbacks(&self) -> Vec<u64> {
        self.rollbacks.lock().unwrap().clone()
    }
}

impl ConsensusObserver for RecordingObserver {
    fn block_confirmed(&self, header: &BlockHeader) {
        self.confirmed.lock().unwrap().push(header.index);
    }

    fn candidate_created(&self, header: &BlockHeader) {
        self.candidates.lock().unwrap().push(header.index);
    }

    fn rolled_back(&self, height: u64) {
        self.rollbacks.lock().unwrap().push(height);
    }
}

/// A node at genesis wired to fakes
pub struct TestNode {
    pub config: ConsensusConfig,
    pub chain: Arc<InMemoryChainStore>,
    pub utxo: Arc<FakeUtxo>,
    pub stake: Arc<FakeStake>,
    pub verifier: Arc<EchoVerifier>,
    pub snapshots: Arc<FakeSnapshots>,
    pub transport: Arc<FakeTransport>,
    pub reputation: Arc<RecordingReputation>,
    pub validator: Arc<FakeValidator>,
    pub clock: Arc<FixedClock>,
    pub observer: Arc<RecordingObserver>,
    pub peers: Arc<PeerBook>,
}

impl TestNode {
    pub fn new() -> Self {
        let utxo = Arc::new(FakeUtxo::default());
        Self {
            config: ConsensusConfig::default(),
            chain: Arc::new(InMemoryChainStore::new(genesis())),
            snapshots: Arc::new(FakeSnapshots::new(utxo.clone())),
            utxo,
            stake: Arc::new(FakeStake::default()),
            verifier: Arc::new(EchoVerifier::default()),
            transport: Arc::new(FakeTransport::default()),
            reputation: Arc::new(RecordingReputation::default()),
            validator: Arc::new(FakeValidator::default()),
            clock: Arc::new(FixedClock::default()),
            observer: Arc::new(RecordingObserver::default()),
            peers: Arc::new(PeerBook::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            chain_store: self.chain.clone(),
            utxo: self.utxo.clone(),
            stake: self.stake.clone(),
            verifier: self.verifier.clone(),
            snapshots: self.snapshots.clone(),
            transport: self.transport.clone(),
            reputation: self.reputation.clone(),
            validator: self.validator.clone(),
            clock: self.clock.clone(),
            observers: vec![self.observer.clone()],
        }
    }

    pub fn pipeline(&self) -> ValidationPipeline {
        ValidationPipeline::new(Arc::new(self.config.clone()), &self.collaborators())
    }

    pub fn fork_choice(&self) -> ForkChoiceEngine {
        ForkChoiceEngine::new(self.chain.clone(), self.snapshots.clone())
    }

    pub fn sync_protocol(&self) -> SyncProtocol {
        SyncProtocol::new(
            Arc::new(self.config.clone()),
            &self.collaborators(),
            self.peers.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::new(self.config.clone()), self.collaborators())
    }

    pub fn core(&self) -> ConsensusCore {
        ConsensusCore::new(self.config.clone(), self.collaborators())
    }
}
