//! Catching up with peers.
//!
//! Peers are asked for their status in parallel, each under its own
//! timeout. The highest one is asked for windows of blocks starting just
//! above the local tip, which are digested one by one through the normal
//! pipeline. A block that fails aborts that peer; after a backoff the next
//! highest is tried. Live gossip is switched off for the duration.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use futures::future::join_all;
use meridian_common::{PeerId, PeerStatus};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::configuration::ConsensusConfig;
use crate::errors::{DigestErrorKind, SyncError};
use crate::finality_cache::FinalityCache;
use crate::interfaces::{ChainStore, Offense, PeerTransport, Reputation};
use crate::task::DigestOptions;
use crate::validation::ValidationPipeline;
use crate::Collaborators;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    /// Every peer failed; the node needs a restart
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No peer is ahead of us
    UpToDate,
    Synced { from: u64, to: u64, peer: PeerId },
}

/// Last status reported by each responsive peer
#[derive(Default)]
pub struct PeerBook {
    peers: DashMap<PeerId, PeerStatus>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, status: PeerStatus) {
        self.peers.insert(status.peer_id.clone(), status);
    }

    pub fn remove(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.get(peer).map(|entry| entry.value().clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

pub struct SyncProtocol {
    config: Arc<ConsensusConfig>,
    chain_store: Arc<dyn ChainStore>,
    transport: Arc<dyn PeerTransport>,
    reputation: Arc<dyn Reputation>,
    peers: Arc<PeerBook>,
    state: SyncState,
}

impl SyncProtocol {
    pub fn new(
        config: Arc<ConsensusConfig>,
        collaborators: &Collaborators,
        peers: Arc<PeerBook>,
    ) -> Self {
        Self {
            config,
            chain_store: collaborators.chain_store.clone(),
            transport: collaborators.transport.clone(),
            reputation: collaborators.reputation.clone(),
            peers,
            state: SyncState::Idle,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Bring the local chain up to the best responsive peer
    pub async fn run(
        &mut self,
        pipeline: &ValidationPipeline,
        cache: &mut FinalityCache,
    ) -> Result<SyncOutcome, SyncError> {
        self.state = SyncState::Syncing;
        self.set_gossip(false).await;

        let result = self.sync(pipeline, cache).await;

        self.set_gossip(true).await;
        self.state = match result {
            Ok(_) => SyncState::Idle,
            Err(_) => SyncState::Failed,
        };
        result
    }

    async fn set_gossip(&self, enabled: bool) {
        for topic in &self.config.gossip_topics {
            let result = if enabled {
                self.transport.subscribe(topic).await
            } else {
                self.transport.unsubscribe(topic).await
            };
            if let Err(e) = result {
                warn!(topic = %topic, enabled, "Failed to change gossip subscription: {e:#}");
            }
        }
    }

    async fn sync(
        &self,
        pipeline: &ValidationPipeline,
        cache: &mut FinalityCache,
    ) -> Result<SyncOutcome, SyncError> {
        let start = self.chain_store.height().await?;
        let mut ahead: Vec<PeerStatus> = self
            .query_peers()
            .await
            .into_iter()
            .filter(|status| status.current_height > start)
            .collect();

        if ahead.is_empty() {
            debug!(height = start, "No peer is ahead");
            return Ok(SyncOutcome::UpToDate);
        }

        ahead.sort_by(|a, b| b.current_height.cmp(&a.current_height));
        info!(
            height = start,
            best = ahead[0].current_height,
            candidates = ahead.len(),
            "Starting sync"
        );

        for (attempt, status) in ahead.iter().enumerate() {
            match self.sync_from(status, pipeline, cache).await {
                Ok(to) => {
                    info!(from = start, to, peer = %status.peer_id, "Sync complete");
                    return Ok(SyncOutcome::Synced {
                        from: start,
                        to,
                        peer: status.peer_id.clone(),
                    });
                }
                Err(e) => {
                    warn!(peer = %status.peer_id, "Sync from peer failed: {e:#}");
                    if attempt + 1 < ahead.len() {
                        sleep(self.config.sync_backoff()).await;
                    }
                }
            }
        }

        Err(SyncError::AllPeersFailed {
            attempted: ahead.len(),
        })
    }

    /// Ask every known peer for its status; non-responders are left out
    async fn query_peers(&self) -> Vec<PeerStatus> {
        let peers = self.transport.peers().await;
        let queries = peers.iter().map(|peer| async move {
            let result = timeout(self.config.peer_timeout(), self.transport.peer_status(peer)).await;
            (peer, result)
        });

        let mut statuses = Vec::new();
        for (peer, result) in join_all(queries).await {
            match result {
                Ok(Ok(status)) => {
                    self.peers.update(status.clone());
                    statuses.push(status);
                }
                Ok(Err(e)) => {
                    debug!(%peer, "Status query failed: {e:#}");
                    self.peers.remove(peer);
                }
                Err(_) => {
                    debug!(%peer, "Status query timed out");
                    self.peers.remove(peer);
                }
            }
        }
        statuses
    }

    /// Fetch and digest blocks from one peer until we reach its height.
    /// Returns the height reached.
    async fn sync_from(
        &self,
        status: &PeerStatus,
        pipeline: &ValidationPipeline,
        cache: &mut FinalityCache,
    ) -> Result<u64> {
        let peer = &status.peer_id;
        let mut target = status.current_height;

        loop {
            let local = self.chain_store.height().await?;
            if local >= target {
                // Reached it; the peer may have moved on meanwhile
                match timeout(self.config.peer_timeout(), self.transport.peer_status(peer)).await {
                    Ok(Ok(refreshed)) if refreshed.current_height > local => {
                        target = refreshed.current_height;
                        self.peers.update(refreshed);
                        continue;
                    }
                    _ => return Ok(local),
                }
            }

            let from = local + 1;
            let to = target.min(local + self.config.sync_window.max(1));
            debug!(%peer, from, to, "Requesting blocks");
            let blocks = timeout(
                self.config.peer_timeout(),
                self.transport.request_blocks(peer, from, to),
            )
            .await
            .map_err(|_| anyhow!("request for blocks {from}..={to} timed out"))??;

            if blocks.is_empty() {
                bail!("peer returned no blocks for {from}..={to}");
            }

            let window = (to - from + 1) as usize;
            for block in blocks.into_iter().take(window) {
                let Err(e) = pipeline.digest(&block, &DigestOptions::sync(), cache).await else {
                    continue;
                };

                match e.kind() {
                    DigestErrorKind::StoreAndReorg
                    | DigestErrorKind::StoreAndReorgCheck
                    | DigestErrorKind::Stale => {
                        cache.insert(block);
                    }
                    DigestErrorKind::Ban => {
                        cache.ban(block.index, block.hash);
                        cache.insert(block);
                        self.reputation.apply_offense(peer, Offense::InvalidSyncBatch);
                    }
                    _ => {}
                }
                return Err(anyhow!(e).context(format!("digesting block from {peer}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestNode;
    use meridian_common::Block;
    use meridian_test_utils::{chain_from, genesis};
    use std::time::Duration;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    fn peer_chain(length: usize, tag: u8) -> Vec<Block> {
        let mut chain = vec![genesis()];
        chain.extend(chain_from(&genesis(), length, tag));
        chain
    }

    async fn run_sync(node: &TestNode, cache: &mut FinalityCache) -> Result<SyncOutcome, SyncError> {
        let mut sync = node.sync_protocol();
        let pipeline = node.pipeline();
        let result = sync.run(&pipeline, cache).await;
        assert_ne!(sync.state(), SyncState::Syncing);
        result
    }

    #[tokio::test(start_paused = true)]
    async fn up_to_date_when_nobody_is_ahead() {
        let node = TestNode::new();
        node.transport.add_peer("a", peer_chain(0, 0));

        let outcome = run_sync(&node, &mut FinalityCache::new()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::UpToDate);
        assert!(node.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_best_peer_in_windows() {
        let node = TestNode::new();
        node.transport.add_peer("short", peer_chain(3, 1));
        node.transport.add_peer("long", peer_chain(10, 0));

        let outcome = run_sync(&node, &mut FinalityCache::new()).await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Synced { from: 0, to: 10, peer: peer("long") }
        );
        assert_eq!(node.chain.height().await.unwrap(), 10);
        let requests = node.transport.requests();
        assert!(requests.iter().all(|(p, from, to)| p == &peer("long") && to - from < 4));
        assert_eq!(requests.first().map(|r| (r.1, r.2)), Some((1, 4)));
        assert_eq!(requests.last().map(|r| (r.1, r.2)), Some((9, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peers_are_excluded_not_penalized() {
        let node = TestNode::new();
        node.transport.add_unresponsive_peer("mute");
        node.transport.add_peer("good", peer_chain(2, 0));

        let outcome = run_sync(&node, &mut FinalityCache::new()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { to: 2, .. }));
        assert!(node.reputation.offenses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_peer_falls_back_to_next() {
        let node = TestNode::new();
        node.transport.add_failing_peer("flaky", 20);
        node.transport.add_peer("steady", peer_chain(5, 0));

        let outcome = run_sync(&node, &mut FinalityCache::new()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced { from: 0, to: 5, peer: peer("steady") }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bad_block_penalizes_peer_and_bans_it() {
        let node = TestNode::new();
        let chain = peer_chain(3, 0);
        node.verifier.forge(chain[2].hash);
        node.transport.add_peer("liar", chain.clone());
        let mut cache = FinalityCache::new();

        let err = run_sync(&node, &mut cache).await.unwrap_err();

        assert!(matches!(err, SyncError::AllPeersFailed { attempted: 1 }));
        assert_eq!(node.chain.height().await.unwrap(), 1);
        assert!(cache.is_banned(&chain[2].hash));
        assert_eq!(
            node.reputation.offenses(),
            vec![(peer("liar"), Offense::InvalidSyncBatch)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn diverging_peer_blocks_are_cached() {
        let node = TestNode::new();
        let local = chain_from(&genesis(), 2, 0);
        for block in &local {
            node.chain.put_block(block, true).await.unwrap();
        }
        // Peer forked at #1 and is now ahead
        let mut fork = vec![genesis(), local[0].clone()];
        fork.extend(chain_from(&local[0], 4, 7));
        node.transport.add_peer("fork", fork.clone());
        let mut cache = FinalityCache::new();

        assert!(run_sync(&node, &mut cache).await.is_err());
        assert!(cache.contains(3, &fork[3].hash));
        assert!(node.reputation.offenses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn requery_follows_a_growing_peer() {
        let node = TestNode::new();
        let chain = peer_chain(6, 0);
        node.transport.add_peer("growing", chain[..4].to_vec());
        node.transport.extend_on_status("growing", chain[4..].to_vec());

        let outcome = run_sync(&node, &mut FinalityCache::new()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { to: 6, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn gossip_paused_during_sync() {
        let node = TestNode::new();
        node.transport.add_peer("a", peer_chain(1, 0));

        run_sync(&node, &mut FinalityCache::new()).await.unwrap();

        assert_eq!(
            node.transport.subscription_log(),
            vec![
                "-blocks.finalized",
                "-blocks.candidate",
                "+blocks.finalized",
                "+blocks.candidate"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn peer_book_tracks_responders() {
        let node = TestNode::new();
        node.transport.add_peer("a", peer_chain(1, 0));
        node.transport.add_unresponsive_peer("b");
        let mut sync = node.sync_protocol();

        let started = tokio::time::Instant::now();
        sync.run(&node.pipeline(), &mut FinalityCache::new()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(node.config.peer_timeout_ms));
        assert_eq!(node.peers.peer_count(), 1);
        assert!(node.peers.get(&peer("a")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fails_when_every_peer_fails() {
        let node = TestNode::new();
        node.transport.add_failing_peer("x", 5);
        node.transport.add_failing_peer("y", 4);

        let err = run_sync(&node, &mut FinalityCache::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::AllPeersFailed { attempted: 2 }));
    }
}
