//! Meridian consensus core
//! Serializes every chain mutation onto one drain loop, validates and
//! applies finalized blocks, switches to better branches and catches up
//! with peers.

pub mod configuration;
pub mod consensus_tree;
pub mod errors;
pub mod finality_cache;
pub mod fork_choice;
pub mod health;
pub mod in_memory_chain_store;
pub mod interfaces;
pub mod observer;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod task_queue;
pub mod tree_block;
pub mod tree_error;
pub mod validation;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use meridian_common::{Block, NodeStatus, PeerId, Transaction};
use tokio::sync::watch;
use tracing::{error, info};

use configuration::ConsensusConfig;
use health::HealthMonitor;
use interfaces::{
    ChainStore, Clock, PeerTransport, ProofVerifier, Reputation, SnapshotStore, StakeTable,
    UtxoStore, ValidatorRole,
};
use observer::ConsensusObserver;
use scheduler::{Scheduler, SchedulerExit, SchedulerHandle};

/// Everything the core depends on but does not own
#[derive(Clone)]
pub struct Collaborators {
    pub chain_store: Arc<dyn ChainStore>,
    pub utxo: Arc<dyn UtxoStore>,
    pub stake: Arc<dyn StakeTable>,
    pub verifier: Arc<dyn ProofVerifier>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub transport: Arc<dyn PeerTransport>,
    pub reputation: Arc<dyn Reputation>,
    pub validator: Arc<dyn ValidatorRole>,
    pub clock: Arc<dyn Clock>,
    pub observers: Vec<Arc<dyn ConsensusObserver>>,
}

/// Consensus core
pub struct ConsensusCore {
    config: Arc<ConsensusConfig>,
    scheduler: Scheduler,
    status: watch::Receiver<NodeStatus>,
}

impl ConsensusCore {
    pub fn new(config: ConsensusConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let scheduler = Scheduler::new(config.clone(), collaborators);
        let status = scheduler.subscribe_status();
        Self {
            config,
            scheduler,
            status,
        }
    }

    /// Build from process configuration, layered over the embedded defaults
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let config = ConsensusConfig::try_load(config)?;

        info!("Target block time {:?}", config.target_block_time());
        info!("Snapshot every {} blocks", config.snapshot_interval);
        info!("Sync window {} blocks", config.sync_window);
        match &config.validator_address {
            Some(address) => info!("Local validator: {address}"),
            None => info!("No local validator"),
        }

        Ok(Self::new(config, collaborators))
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Latest published status; may lag the drain loop slightly
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Receiver that sees every status update
    pub fn status_receiver(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn submit_transaction(&self, tx: Transaction) -> bool {
        self.handle().submit_transaction(tx)
    }

    pub fn submit_block(&self, block: Block, source: Option<PeerId>) -> bool {
        self.handle().submit_block(block, source)
    }

    /// Run the drain loop and the health monitor until terminated.
    ///
    /// Returns [`SchedulerExit::RestartRequested`] if the node fell behind
    /// and could not sync from any peer.
    pub async fn run(mut self) -> SchedulerExit {
        let monitor = HealthMonitor::new(
            self.scheduler.health(),
            self.scheduler.handle(),
            self.config.target_block_time(),
            self.config.health_interval(),
        );
        let monitor = tokio::spawn(monitor.run());

        let exit = self.scheduler.run().await;

        self.scheduler.handle().terminate();
        if let Err(e) = monitor.await {
            error!("Health monitor failed: {e}");
        }
        exit
    }
}
