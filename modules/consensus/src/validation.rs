//! Block validation and digestion.
//!
//! A finalized block is checked against the local tip in a fixed order and,
//! if it passes, applied to every dependent store. The first failing check
//! decides the error kind, which in turn decides what the scheduler does
//! with the block.

use std::collections::HashSet;
use std::sync::Arc;

use meridian_common::calculations::{block_reward, final_difficulty, reward_split};
use meridian_common::{Block, BlockHeader};
use tracing::{debug, info, warn};

use crate::configuration::ConsensusConfig;
use crate::errors::DigestError;
use crate::finality_cache::FinalityCache;
use crate::interfaces::{
    ChainStore, Clock, DiscoveredAddress, ProofVerifier, SnapshotStore, StakeTable,
    TransactionVerdict, UtxoStore,
};
use crate::observer::Observers;
use crate::task::DigestOptions;
use crate::Collaborators;

/// A block that made it onto the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub header: BlockHeader,
    /// The block was produced by this node's own validator
    pub local_validator: bool,
}

/// Where a block's index falls relative to the local height
pub fn check_height(index: u64, height: u64, max_block_gap: u64) -> Result<(), DigestError> {
    if index <= height {
        Err(DigestError::Stale { index, height })
    } else if index > height.saturating_add(max_block_gap) {
        Err(DigestError::OutOfRange { index, height })
    } else if index > height + 1 {
        Err(DigestError::StoreAndReorgCheck { index, height })
    } else {
        Ok(())
    }
}

fn check_linkage(block: &Block, tip: &Block) -> Result<(), DigestError> {
    if block.prev_hash != tip.hash {
        return Err(DigestError::StoreAndReorg {
            index: block.index,
            prev_hash: block.prev_hash,
            tip: tip.hash,
        });
    }
    Ok(())
}

pub struct ValidationPipeline {
    config: Arc<ConsensusConfig>,
    chain_store: Arc<dyn ChainStore>,
    utxo: Arc<dyn UtxoStore>,
    stake: Arc<dyn StakeTable>,
    verifier: Arc<dyn ProofVerifier>,
    snapshots: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    observers: Observers,
}

impl ValidationPipeline {
    pub fn new(config: Arc<ConsensusConfig>, collaborators: &Collaborators) -> Self {
        Self {
            config,
            chain_store: collaborators.chain_store.clone(),
            utxo: collaborators.utxo.clone(),
            stake: collaborators.stake.clone(),
            verifier: collaborators.verifier.clone(),
            snapshots: collaborators.snapshots.clone(),
            clock: collaborators.clock.clone(),
            observers: Observers::new(collaborators.observers.clone()),
        }
    }

    /// Validate `block` against the local tip and apply it
    pub async fn digest(
        &self,
        block: &Block,
        options: &DigestOptions,
        cache: &FinalityCache,
    ) -> Result<Accepted, DigestError> {
        if cache.is_banned(&block.hash) {
            return Err(DigestError::ban(block.index, "block hash is banned"));
        }

        let height = self.chain_store.height().await?;
        check_height(block.index, height, self.config.max_block_gap)?;

        let tip = self.chain_store.last_block().await?;
        let discovered = if options.skip_validation {
            // Replayed blocks are trusted but must still extend the tip
            check_linkage(block, &tip)?;
            Vec::new()
        } else {
            self.check_proof(block).await?;
            check_linkage(block, &tip)?;
            self.check_work(block, &tip).await?;
            self.check_timestamps(block, &tip)?;
            self.check_legitimacy(block).await?;
            self.check_rewards(block, &tip)?;
            self.check_double_spend(block).await?;

            match self.verifier.verify_transactions(block).await? {
                TransactionVerdict::Valid { discovered } => discovered,
                TransactionVerdict::Invalid { reason } => {
                    return Err(DigestError::ban(block.index, reason));
                }
            }
        };

        self.apply(block, options, discovered).await?;

        let header = block.header();
        info!(
            block = block.index,
            hash = %block.hash.short(),
            txs = block.transactions.len(),
            sync = options.is_sync,
            "Block accepted"
        );
        self.observers.block_confirmed(&header);

        Ok(Accepted {
            local_validator: self.config.is_local_validator(header.validator.as_ref()),
            header,
        })
    }

    async fn check_proof(&self, block: &Block) -> Result<(), DigestError> {
        let proof = self.verifier.proof_hash(block).await?;
        if proof != block.hash {
            return Err(DigestError::ban(
                block.index,
                format!("proof hash {} does not match", proof.short()),
            ));
        }
        Ok(())
    }

    /// The declared difficulty is only trusted once it matches what the
    /// verifier expects after `parent`
    async fn check_work(&self, block: &Block, parent: &Block) -> Result<(), DigestError> {
        let base = self.verifier.base_difficulty(parent).await?;
        if block.difficulty != base {
            return Err(DigestError::ban(
                block.index,
                format!("declares difficulty {}, expected {base}", block.difficulty),
            ));
        }

        let target = final_difficulty(
            base,
            block.legitimacy,
            block.pos_timestamp,
            block.timestamp,
            self.config.difficulty_decay_ms,
        );
        let work = block.hash.leading_zero_bits();
        if work < target {
            return Err(DigestError::ban(
                block.index,
                format!("insufficient work: {work} zero bits, {target} required"),
            ));
        }
        Ok(())
    }

    fn check_timestamps(&self, block: &Block, parent: &Block) -> Result<(), DigestError> {
        if block.pos_timestamp <= parent.timestamp {
            return Err(DigestError::hard_invalid(
                block.index,
                "candidate assembled before parent was final",
            ));
        }
        if block.timestamp < block.pos_timestamp {
            return Err(DigestError::hard_invalid(
                block.index,
                "final timestamp precedes candidate timestamp",
            ));
        }

        let limit = self.clock.now_millis().saturating_add(self.config.timestamp_tolerance_ms);
        if block.timestamp > limit {
            return Err(DigestError::hard_invalid(
                block.index,
                format!("timestamp {} is in the future", block.timestamp),
            ));
        }
        Ok(())
    }

    async fn check_legitimacy(&self, block: &Block) -> Result<(), DigestError> {
        let validator = block
            .validator_address()
            .ok_or_else(|| DigestError::ban(block.index, "missing reward transaction"))?;

        match self.stake.legitimacy_for(validator, &block.prev_hash).await? {
            Some(legitimacy) if legitimacy == block.legitimacy => Ok(()),
            Some(legitimacy) => Err(DigestError::hard_invalid(
                block.index,
                format!(
                    "{validator} holds legitimacy {legitimacy}, block claims {}",
                    block.legitimacy
                ),
            )),
            None => Err(DigestError::hard_invalid(
                block.index,
                format!("{validator} is not eligible this round"),
            )),
        }
    }

    fn check_rewards(&self, block: &Block, parent: &Block) -> Result<(), DigestError> {
        let scheduled = block_reward(
            parent.index,
            self.config.initial_reward,
            self.config.halving_interval,
        );
        if block.coin_base != scheduled {
            return Err(DigestError::ban(
                block.index,
                format!("coinbase {} differs from schedule {scheduled}", block.coin_base),
            ));
        }

        let reward = block
            .reward_transaction()
            .ok_or_else(|| DigestError::ban(block.index, "missing reward transaction"))?;
        if !reward.inputs.is_empty() || reward.outputs.len() != 2 {
            return Err(DigestError::ban(block.index, "malformed reward transaction"));
        }

        let fees = block
            .total_fees()
            .ok_or_else(|| DigestError::ban(block.index, "declared fees overflow"))?;
        let (pos, pow) = reward_split(block.coin_base, fees, self.config.pos_reward_percent)
            .ok_or_else(|| DigestError::ban(block.index, "validator reward overflows"))?;
        if reward.outputs[0].amount != pos || reward.outputs[1].amount != pow {
            return Err(DigestError::ban(
                block.index,
                format!(
                    "reward outputs {}/{} do not match split {pos}/{pow}",
                    reward.outputs[0].amount, reward.outputs[1].amount
                ),
            ));
        }
        Ok(())
    }

    async fn check_double_spend(&self, block: &Block) -> Result<(), DigestError> {
        let mut seen = HashSet::new();
        for input in block.user_transactions().iter().flat_map(|tx| &tx.inputs) {
            if !seen.insert(input.anchor) {
                return Err(DigestError::ban(
                    block.index,
                    format!("{} spent twice in block", input.anchor),
                ));
            }
            if self.utxo.get_utxo(&input.anchor).await?.is_none() {
                return Err(DigestError::ban(
                    block.index,
                    format!("{} is not an unspent output", input.anchor),
                ));
            }
        }
        Ok(())
    }

    /// Linkage has been checked by the caller, so `put_block` only fails on
    /// store errors. Once it succeeds the block is on the chain and later
    /// housekeeping failures are logged rather than reported.
    async fn apply(
        &self,
        block: &Block,
        options: &DigestOptions,
        discovered: Vec<DiscoveredAddress>,
    ) -> Result<(), DigestError> {
        self.utxo.apply_block(block).await?;
        self.stake.apply_block(block).await?;
        self.chain_store.put_block(block, options.persist_to_disk).await?;

        if let Err(e) = self.utxo.prune_for_block(block).await {
            warn!(block = block.index, "Mempool prune failed: {e:#}");
        }
        if !discovered.is_empty() {
            if let Err(e) = self.utxo.merge_known_addresses(discovered).await {
                warn!(block = block.index, "Could not record discovered addresses: {e:#}");
            }
        }

        if self.config.snapshot_interval > 0 && block.index % self.config.snapshot_interval == 0 {
            debug!(block = block.index, "Taking snapshot");
            if let Err(e) = self.snapshots.snapshot_at(block.index).await {
                warn!(block = block.index, "Snapshot failed: {e:#}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DigestErrorKind;
    use crate::test_utils::TestNode;
    use meridian_common::{Anchor, TxOutput};
    use meridian_test_utils::{address, chain_from, genesis, transaction, tx_hash, BlockBuilder};
    use test_case::test_case;

    #[test_case(2, 1 => None ; "next block")]
    #[test_case(1, 1 => Some(DigestErrorKind::Stale) ; "same height")]
    #[test_case(0, 1 => Some(DigestErrorKind::Stale) ; "below")]
    #[test_case(3, 1 => Some(DigestErrorKind::StoreAndReorgCheck) ; "two ahead")]
    #[test_case(10, 1 => Some(DigestErrorKind::StoreAndReorgCheck) ; "gap limit")]
    #[test_case(11, 1 => Some(DigestErrorKind::OutOfRange) ; "past gap limit")]
    fn height_classification(index: u64, height: u64) -> Option<DigestErrorKind> {
        check_height(index, height, 9).err().map(|e| e.kind())
    }

    async fn digest(node: &TestNode, block: &Block) -> Result<Accepted, DigestError> {
        node.pipeline()
            .digest(block, &DigestOptions::gossip(), &FinalityCache::new())
            .await
    }

    async fn kind(node: &TestNode, block: &Block) -> Option<DigestErrorKind> {
        digest(node, block).await.err().map(|e| e.kind())
    }

    #[tokio::test]
    async fn accepts_next_block_and_applies_it() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).build();

        let accepted = digest(&node, &block).await.unwrap();

        assert_eq!(accepted.header, block.header());
        assert!(!accepted.local_validator);
        assert_eq!(node.chain.height().await.unwrap(), 1);
        assert_eq!(node.utxo.applied(), vec![1]);
        assert_eq!(node.stake.applied(), vec![1]);
        assert_eq!(node.observer.confirmed(), vec![1]);
    }

    #[tokio::test]
    async fn recognises_local_validator() {
        let mut node = TestNode::new();
        node.config.validator_address = Some(address("validator"));
        let block = BlockBuilder::child_of(&genesis()).build();

        assert!(digest(&node, &block).await.unwrap().local_validator);
    }

    #[tokio::test]
    async fn forged_proof_is_banned() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).build();
        node.verifier.forge(block.hash);

        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
        assert_eq!(node.chain.height().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insufficient_work_is_banned() {
        let node = TestNode::new();
        node.verifier.set_base_difficulty(250);
        let block = BlockBuilder::child_of(&genesis()).difficulty(250).build();
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
    }

    #[tokio::test]
    async fn understated_difficulty_is_banned() {
        let node = TestNode::new();
        node.verifier.set_base_difficulty(4);
        // Zero leading bits would satisfy the declared difficulty
        let block = BlockBuilder::child_of(&genesis()).difficulty(0).build();
        let err = digest(&node, &block).await.unwrap_err();

        assert_eq!(err.kind(), DigestErrorKind::Ban);
        assert!(err.to_string().contains("expected 4"));
    }

    #[tokio::test]
    async fn wrong_parent_is_not_judged_on_difficulty() {
        let node = TestNode::new();
        node.verifier.set_base_difficulty(0);
        let other = BlockBuilder::child_of(&genesis()).tag(4).build();
        let orphan = BlockBuilder::child_of(&other).difficulty(7).build();
        node.chain.put_block(&BlockBuilder::child_of(&genesis()).build(), true).await.unwrap();

        assert_eq!(kind(&node, &orphan).await, Some(DigestErrorKind::StoreAndReorg));
    }

    #[tokio::test]
    async fn wrong_parent_is_stored_for_reorg() {
        let node = TestNode::new();
        let other = BlockBuilder::child_of(&genesis()).tag(4).build();
        let orphan = BlockBuilder::child_of(&other).build();
        node.chain.put_block(&BlockBuilder::child_of(&genesis()).build(), true).await.unwrap();

        assert_eq!(kind(&node, &orphan).await, Some(DigestErrorKind::StoreAndReorg));
    }

    #[tokio::test]
    async fn future_timestamp_is_hard_invalid() {
        let node = TestNode::new();
        node.clock.set(genesis().timestamp);
        let block = BlockBuilder::child_of(&genesis()).delayed_by(120_000).build();
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::HardInvalid));
    }

    #[tokio::test]
    async fn candidate_before_parent_is_hard_invalid() {
        let node = TestNode::new();
        let mut block = BlockBuilder::child_of(&genesis()).build();
        block.pos_timestamp = genesis().timestamp;
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::HardInvalid));
    }

    #[tokio::test]
    async fn legitimacy_mismatch_is_hard_invalid() {
        let node = TestNode::new();
        node.stake.set_rank(&address("validator"), 2);
        let block = BlockBuilder::child_of(&genesis()).legitimacy(1).build();
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::HardInvalid));

        let honest = BlockBuilder::child_of(&genesis()).legitimacy(2).build();
        assert!(digest(&node, &honest).await.is_ok());
    }

    #[tokio::test]
    async fn ineligible_validator_is_hard_invalid() {
        let node = TestNode::new();
        node.stake.exclude(&address("validator"));
        let block = BlockBuilder::child_of(&genesis()).build();
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::HardInvalid));
    }

    #[tokio::test]
    async fn wrong_coinbase_is_banned() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).coin_base(5_000).build();
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
    }

    #[tokio::test]
    async fn reward_split_must_include_fees() {
        let node = TestNode::new();
        let anchor = Anchor::new(tx_hash(1), 0);
        node.utxo.fund(anchor, TxOutput { address: address("alice"), amount: 50 });
        let mut block = BlockBuilder::child_of(&genesis())
            .with_transaction(transaction(2, &[anchor], 7))
            .build();
        // Validator keeps the fees out of the miner's share
        block.transactions[0].outputs[0].amount -= 7;
        block.transactions[0].outputs[1].amount += 7;

        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
    }

    #[tokio::test]
    async fn overflowing_fees_are_banned() {
        let node = TestNode::new();
        let (a, b) = (Anchor::new(tx_hash(1), 0), Anchor::new(tx_hash(1), 1));
        node.utxo.fund(a, TxOutput { address: address("alice"), amount: 50 });
        node.utxo.fund(b, TxOutput { address: address("bob"), amount: 50 });
        let block = BlockBuilder::child_of(&genesis())
            .with_transaction(transaction(2, &[a], u64::MAX))
            .with_transaction(transaction(3, &[b], 2))
            .build();

        let err = digest(&node, &block).await.unwrap_err();
        assert_eq!(err.kind(), DigestErrorKind::Ban);
        assert_eq!(node.chain.height().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn validator_share_overflow_is_banned() {
        let node = TestNode::new();
        let anchor = Anchor::new(tx_hash(1), 0);
        node.utxo.fund(anchor, TxOutput { address: address("alice"), amount: 50 });
        let block = BlockBuilder::child_of(&genesis())
            .with_transaction(transaction(2, &[anchor], u64::MAX))
            .build();

        let err = digest(&node, &block).await.unwrap_err();
        assert_eq!(err.kind(), DigestErrorKind::Ban);
        assert!(err.to_string().contains("overflows"));
    }

    #[tokio::test]
    async fn double_spend_within_block_is_banned() {
        let node = TestNode::new();
        let anchor = Anchor::new(tx_hash(1), 0);
        node.utxo.fund(anchor, TxOutput { address: address("alice"), amount: 50 });
        let block = BlockBuilder::child_of(&genesis())
            .with_transaction(transaction(2, &[anchor], 1))
            .with_transaction(transaction(3, &[anchor], 1))
            .build();

        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
    }

    #[tokio::test]
    async fn unknown_anchor_is_banned() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis())
            .with_transaction(transaction(2, &[Anchor::new(tx_hash(9), 0)], 1))
            .build();
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
    }

    #[tokio::test]
    async fn invalid_transactions_are_banned() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).build();
        node.verifier.reject(block.hash);
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
    }

    #[tokio::test]
    async fn spends_and_learns_addresses() {
        let node = TestNode::new();
        let anchor = Anchor::new(tx_hash(1), 0);
        node.utxo.fund(anchor, TxOutput { address: address("alice"), amount: 50 });
        let tx = transaction(2, &[anchor], 3);
        node.utxo.push_transaction(&tx).await.unwrap();
        let block = BlockBuilder::child_of(&genesis()).with_transaction(tx).build();

        digest(&node, &block).await.unwrap();

        assert!(node.utxo.get_utxo(&anchor).await.unwrap().is_none());
        assert_eq!(node.utxo.mempool_size().await, 0);
        assert_eq!(node.utxo.known_addresses().len(), 1);
    }

    #[tokio::test]
    async fn banned_hash_rejected_before_any_check() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).build();
        let mut cache = FinalityCache::new();
        cache.ban(block.index, block.hash);

        let err = node
            .pipeline()
            .digest(&block, &DigestOptions::gossip(), &cache)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DigestErrorKind::Ban);
        assert_eq!(node.chain.height().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skip_validation_trusts_the_block() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).coin_base(5_000).build();
        node.verifier.forge(block.hash);

        node.pipeline()
            .digest(&block, &DigestOptions::replay(), &FinalityCache::new())
            .await
            .unwrap();
        assert_eq!(node.chain.height().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replayed_block_must_extend_tip_before_any_state_changes() {
        let node = TestNode::new();
        node.chain.put_block(&BlockBuilder::child_of(&genesis()).build(), true).await.unwrap();
        let other = BlockBuilder::child_of(&genesis()).tag(4).build();
        let misplaced = BlockBuilder::child_of(&other).build();

        let err = node
            .pipeline()
            .digest(&misplaced, &DigestOptions::replay(), &FinalityCache::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), DigestErrorKind::StoreAndReorg);
        assert!(node.utxo.applied().is_empty());
        assert!(node.stake.applied().is_empty());
        assert_eq!(node.chain.height().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn snapshot_failure_does_not_reject_a_stored_block() {
        let node = TestNode::new();
        node.snapshots.fail_snapshots();
        let blocks = chain_from(&genesis(), 5, 0);
        for block in &blocks {
            digest(&node, block).await.unwrap();
        }

        assert_eq!(node.chain.height().await.unwrap(), 5);
        assert_eq!(node.observer.confirmed(), vec![1, 2, 3, 4, 5]);
        assert_eq!(node.snapshots.heights_available().await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn snapshots_every_interval() {
        let node = TestNode::new();
        for block in chain_from(&genesis(), 6, 0) {
            digest(&node, &block).await.unwrap();
        }

        let mut heights = node.snapshots.heights_available().await.unwrap();
        heights.sort();
        assert_eq!(heights, vec![0, 5]);
    }

    #[tokio::test]
    async fn same_invalid_block_fails_the_same_way_twice() {
        let node = TestNode::new();
        let block = BlockBuilder::child_of(&genesis()).coin_base(1).build();

        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
        assert_eq!(kind(&node, &block).await, Some(DigestErrorKind::Ban));
        assert_eq!(node.chain.height().await.unwrap(), 0);
    }
}
