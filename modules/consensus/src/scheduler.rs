//! The single writer.
//!
//! Every operation that mutates chain state arrives here as a [`Task`] and
//! runs to completion on the drain loop before the next one is popped. I/O
//! inside a task may suspend, but nothing else touches the chain while it
//! does.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use meridian_common::{Block, NodeStatus, PeerId, Transaction};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::configuration::ConsensusConfig;
use crate::errors::{DigestError, DigestErrorKind};
use crate::finality_cache::FinalityCache;
use crate::fork_choice::{ForkChoiceEngine, ReorgPlan};
use crate::health::{HealthState, SharedHealth};
use crate::interfaces::{
    ChainStore, Offense, PeerTransport, Reputation, SnapshotStore, UtxoStore, ValidatorRole,
};
use crate::observer::Observers;
use crate::sync::{PeerBook, SyncProtocol};
use crate::task::{DigestOptions, Priority, Task};
use crate::task_queue::TaskQueue;
use crate::validation::ValidationPipeline;
use crate::Collaborators;

/// Why the drain loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Terminated,
    /// Sync failed against every peer; the node must restart
    RestartRequested,
}

/// Cheap handle for feeding the scheduler from other tasks
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: Arc<TaskQueue>,
}

impl SchedulerHandle {
    pub(crate) fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }

    pub fn enqueue(&self, task: Task) -> bool {
        self.queue.push(task, Priority::Normal)
    }

    pub fn enqueue_front(&self, task: Task) -> bool {
        self.queue.push(task, Priority::Front)
    }

    /// Queue a whole reorg plan ahead of everything else.
    /// Returns false if another plan is still pending.
    pub fn enqueue_reorg_plan(&self, plan: &ReorgPlan) -> bool {
        self.queue.push_reorg_plan(plan.tasks())
    }

    pub fn submit_transaction(&self, tx: Transaction) -> bool {
        self.enqueue(Task::PushTransaction(tx))
    }

    /// A finalized block received from the network
    pub fn submit_block(&self, block: Block, source: Option<PeerId>) -> bool {
        self.enqueue(Task::digest(block, DigestOptions::gossip(), source))
    }

    pub fn terminate(&self) {
        self.queue.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_terminated()
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

pub struct Scheduler {
    config: Arc<ConsensusConfig>,
    queue: Arc<TaskQueue>,
    pipeline: ValidationPipeline,
    fork_choice: ForkChoiceEngine,
    sync: SyncProtocol,
    cache: FinalityCache,

    chain_store: Arc<dyn ChainStore>,
    utxo: Arc<dyn UtxoStore>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<dyn PeerTransport>,
    reputation: Arc<dyn Reputation>,
    validator: Arc<dyn ValidatorRole>,
    observers: Observers,

    health: SharedHealth,
    peers: Arc<PeerBook>,
    status: watch::Sender<NodeStatus>,

    /// Candidate this node last produced on top of the tip
    candidate: Option<Block>,
    /// Inside a ReorgStart/ReorgEnd bracket
    in_reorg: bool,
    exit: Option<SchedulerExit>,
}

impl Scheduler {
    pub fn new(config: Arc<ConsensusConfig>, collaborators: Collaborators) -> Self {
        let peers = Arc::new(PeerBook::new());
        let (status, _) = watch::channel(NodeStatus::default());

        Self {
            pipeline: ValidationPipeline::new(config.clone(), &collaborators),
            fork_choice: ForkChoiceEngine::new(
                collaborators.chain_store.clone(),
                collaborators.snapshots.clone(),
            ),
            sync: SyncProtocol::new(config.clone(), &collaborators, peers.clone()),
            queue: Arc::new(TaskQueue::new()),
            cache: FinalityCache::new(),
            chain_store: collaborators.chain_store,
            utxo: collaborators.utxo,
            snapshots: collaborators.snapshots,
            transport: collaborators.transport,
            reputation: collaborators.reputation,
            validator: collaborators.validator,
            observers: Observers::new(collaborators.observers),
            health: Arc::new(Mutex::new(HealthState::new(Instant::now()))),
            peers,
            status,
            candidate: None,
            in_reorg: false,
            exit: None,
            config,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.queue.clone())
    }

    pub fn health(&self) -> SharedHealth {
        self.health.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    pub fn cache(&self) -> &FinalityCache {
        &self.cache
    }

    pub fn candidate(&self) -> Option<&Block> {
        self.candidate.as_ref()
    }

    /// Drain tasks until terminated
    pub async fn run(&mut self) -> SchedulerExit {
        info!("Scheduler running");
        self.publish_status().await;

        loop {
            if let Some(exit) = self.exit.take() {
                info!(?exit, "Scheduler stopped");
                return exit;
            }
            if self.queue.is_terminated() {
                info!("Scheduler terminated");
                return SchedulerExit::Terminated;
            }

            match self.queue.pop() {
                Some(task) => self.run_task(task).await,
                None => self.queue.wait(self.config.idle_poll()).await,
            }
        }
    }

    /// Drain whatever is runnable right now, then return
    pub async fn run_until_idle(&mut self) {
        while self.exit.is_none() {
            let Some(task) = self.queue.pop() else {
                break;
            };
            self.run_task(task).await;
        }
    }

    async fn run_task(&mut self, task: Task) {
        let span = info_span!("consensus.task", task = task.name());
        async {
            self.execute(task).await;
            self.publish_status().await;
        }
        .instrument(span)
        .await;
    }

    async fn execute(&mut self, task: Task) {
        match task {
            Task::PushTransaction(tx) => match self.utxo.push_transaction(&tx).await {
                Ok(()) => debug!(tx = %tx.id.short(), "Transaction admitted"),
                Err(e) if e.is_benign() => debug!(tx = %tx.id.short(), "Transaction ignored: {e}"),
                Err(e) => warn!(tx = %tx.id.short(), "Transaction rejected: {e:#}"),
            },

            Task::DigestBlock {
                block,
                options,
                source,
            } => self.digest_block(*block, options, source).await,

            Task::SyncWithPeers => self.sync_with_peers().await,

            Task::CreateCandidate => {
                if let Err(e) = self.create_candidate().await {
                    warn!("Candidate creation failed: {e:#}");
                }
            }

            Task::RollbackTo { height } => {
                if let Err(e) = self.rollback_to(height).await {
                    error!(height, "Rollback failed: {e:#}");
                    if self.in_reorg {
                        self.abort_reorg().await;
                    }
                }
            }

            Task::ReorgStart => {
                info!("Reorg started");
                self.in_reorg = true;
                self.queue.pause();
            }

            Task::ReorgEnd => {
                self.in_reorg = false;
                self.queue.end_reorg();
                let height = self.chain_store.height().await.unwrap_or_default();
                info!(height, "Reorg complete");
                self.check_reorg().await;
            }

            Task::CheckReorg => {
                self.check_reorg().await;
                self.queue.reorg_check_finished();
            }
        }
    }

    async fn digest_block(&mut self, block: Block, options: DigestOptions, source: Option<PeerId>) {
        match self.pipeline.digest(&block, &options, &self.cache).await {
            Ok(accepted) => {
                self.record_health(|h, now| h.record_digest(now));
                self.cache.remove(block.index, &block.hash);
                self.prune_cache(block.index);
                self.candidate = None;

                if options.broadcast_new_candidate && !accepted.local_validator {
                    self.schedule_candidate();
                }
                if !self.in_reorg {
                    self.connect_cached_children(&block);
                }
            }
            Err(e) => self.handle_digest_error(block, source, e).await,
        }
    }

    async fn handle_digest_error(&mut self, block: Block, source: Option<PeerId>, error: DigestError) {
        let kind = error.kind();
        let (index, hash) = (block.index, block.hash);

        match kind {
            DigestErrorKind::OutOfRange => {
                info!(block = index, "Block far ahead, we are behind: {error}");
                if !self.in_reorg {
                    self.queue.push(Task::SyncWithPeers, Priority::Normal);
                }
            }
            DigestErrorKind::StoreAndReorgCheck | DigestErrorKind::StoreAndReorg => {
                debug!(block = index, "Caching block: {error}");
                self.cache.insert(block);
            }
            DigestErrorKind::Stale => {
                debug!(block = index, "Caching stale block: {error}");
                self.cache.insert(block);
            }
            DigestErrorKind::Ban => {
                warn!(block = index, hash = %hash.short(), "Banning block: {error}");
                self.cache.insert(block);
                self.cache.ban(index, hash);
                if let Some(peer) = &source {
                    self.reputation.apply_offense(peer, Offense::InvalidBlock);
                }
            }
            DigestErrorKind::HardInvalid => {
                warn!(block = index, "Dropping invalid block: {error}");
                self.cache.remove(index, &hash);
            }
            DigestErrorKind::Internal => {
                error!(block = index, "Digest failed: {error:#}");
                if self.in_reorg {
                    self.cache.remove(index, &hash);
                }
            }
        }

        if self.in_reorg {
            // The rest of the plan builds on this block
            warn!(block = index, "Reorg step failed, abandoning plan");
            self.abort_reorg().await;
        } else if matches!(
            kind,
            DigestErrorKind::StoreAndReorgCheck | DigestErrorKind::StoreAndReorg
        ) {
            self.check_reorg().await;
        }
    }

    async fn abort_reorg(&mut self) {
        let dropped = self.queue.abort_reorg();
        self.in_reorg = false;
        debug!(dropped, "Dropped remaining reorg steps");
        // Rolled-back blocks are cached, so fork choice can find the way back
        self.check_reorg().await;
    }

    /// Digest cached blocks that build directly on a newly accepted one
    fn connect_cached_children(&self, parent: &Block) {
        for child in self.cache.at_height(parent.index + 1) {
            if child.prev_hash == parent.hash && !self.cache.is_banned(&child.hash) {
                debug!(block = child.index, "Connecting cached child");
                self.queue.push(
                    Task::digest(child.clone(), DigestOptions::gossip(), None),
                    Priority::Front,
                );
            }
        }
    }

    async fn check_reorg(&mut self) {
        self.record_health(|h, now| h.record_reorg_check(now));
        if self.queue.reorg_pending() {
            return;
        }

        match self.fork_choice.evaluate(&mut self.cache).await {
            Ok(Some(plan)) => {
                if !self.queue.push_reorg_plan(plan.tasks()) {
                    debug!("Reorg plan refused, another is pending");
                }
            }
            Ok(None) => {}
            Err(e) => error!("Fork choice failed: {e:#}"),
        }
    }

    async fn sync_with_peers(&mut self) {
        let result = self.sync.run(&self.pipeline, &mut self.cache).await;
        self.queue.sync_finished();

        match result {
            Ok(outcome) => {
                debug!(?outcome, "Sync finished");
                self.record_health(|h, now| h.record_sync(now));
                if let Ok(height) = self.chain_store.height().await {
                    self.prune_cache(height);
                }
                if !self.cache.is_empty() {
                    self.check_reorg().await;
                }
            }
            Err(e) => {
                error!("Sync failed, restart required: {e}");
                let height = self.chain_store.height().await.unwrap_or_default();
                let keep = height.saturating_sub(meridian_common::params::SYNC_FAILURE_SNAPSHOT_MARGIN);
                if let Err(e) = self.snapshots.erase_above(keep).await {
                    error!(keep, "Failed to trim snapshots: {e:#}");
                }
                self.queue.terminate();
                self.exit = Some(SchedulerExit::RestartRequested);
            }
        }
    }

    async fn create_candidate(&mut self) -> Result<()> {
        let tip = self.chain_store.last_block().await?;
        if self.candidate.as_ref().is_some_and(|c| c.prev_hash == tip.hash) {
            debug!(height = tip.index, "Candidate already exists for tip");
            return Ok(());
        }

        let Some(candidate) = self.validator.create_candidate(&tip).await? else {
            debug!(height = tip.index, "Not eligible to validate this round");
            return Ok(());
        };

        if let Err(e) = self.transport.broadcast(&self.config.candidate_topic, &candidate).await {
            warn!(block = candidate.index, "Candidate broadcast failed: {e:#}");
        }
        info!(block = candidate.index, hash = %candidate.hash.short(), "Candidate created");
        self.observers.candidate_created(&candidate.header());
        self.candidate = Some(candidate);
        Ok(())
    }

    /// Restore state to a snapshot and move chain blocks above it into the
    /// cache
    async fn rollback_to(&mut self, height: u64) -> Result<()> {
        self.snapshots.rollback_to(height).await?;
        self.snapshots.erase_above(height).await?;

        let erased = self.chain_store.erase_above(height).await?;
        info!(height, erased = erased.len(), "Rolled back");
        for block in erased {
            self.cache.insert(block);
        }

        self.candidate = None;
        self.observers.rolled_back(height);
        Ok(())
    }

    fn schedule_candidate(&self) {
        let handle = self.handle();
        let delay = self.config.candidate_settle_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.enqueue(Task::CreateCandidate);
        });
    }

    fn prune_cache(&mut self, height: u64) {
        let cutoff = height.saturating_sub(2 * self.config.snapshot_interval);
        self.cache.prune_below(cutoff);
    }

    fn record_health(&self, update: impl FnOnce(&mut HealthState, Instant)) {
        let mut health = self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut health, Instant::now());
    }

    async fn publish_status(&self) {
        let Ok(tip) = self.chain_store.last_block().await else {
            return;
        };
        self.status.send_replace(NodeStatus {
            height: tip.index,
            tip: tip.hash,
            peer_count: self.peers.peer_count(),
            mempool_size: self.utxo.mempool_size().await,
        });
    }
}
