use std::time::Duration;

use anyhow::Result;
use config::Config;
use meridian_common::Address;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsensusConfig {
    pub target_block_time_ms: u64,
    pub max_block_gap: u64,
    pub snapshot_interval: u64,
    pub timestamp_tolerance_ms: u64,
    pub candidate_settle_delay_ms: u64,
    pub sync_window: u64,
    pub peer_timeout_ms: u64,
    pub sync_backoff_ms: u64,
    pub difficulty_decay_ms: u64,
    pub pos_reward_percent: u8,
    pub initial_reward: u64,
    pub halving_interval: u64,
    pub idle_poll_ms: u64,
    pub health_interval_ms: u64,
    #[serde(default)]
    pub validator_address: Option<Address>,
    #[serde(default)]
    pub gossip_topics: Vec<String>,
    /// Topic new candidates are broadcast on
    pub candidate_topic: String,
}

impl ConsensusConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn target_block_time(&self) -> Duration {
        Duration::from_millis(self.target_block_time_ms)
    }

    pub fn candidate_settle_delay(&self) -> Duration {
        Duration::from_millis(self.candidate_settle_delay_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sync_backoff(&self) -> Duration {
        Duration::from_millis(self.sync_backoff_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// True if `address` is this node's own validator address
    pub fn is_local_validator(&self, address: Option<&Address>) -> bool {
        match (&self.validator_address, address) {
            (Some(local), Some(address)) => local == address,
            _ => false,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            target_block_time_ms: meridian_common::params::TARGET_BLOCK_TIME_MS,
            max_block_gap: meridian_common::params::MAX_BLOCK_GAP,
            snapshot_interval: meridian_common::params::SNAPSHOT_INTERVAL,
            timestamp_tolerance_ms: 60_000,
            candidate_settle_delay_ms: 500,
            sync_window: 4,
            peer_timeout_ms: 3_000,
            sync_backoff_ms: 1_000,
            difficulty_decay_ms: 1_000,
            pos_reward_percent: 50,
            initial_reward: 1_000,
            halving_interval: 1_000_000,
            idle_poll_ms: 10,
            health_interval_ms: 1_000,
            validator_address: None,
            gossip_topics: vec!["blocks.finalized".to_string(), "blocks.candidate".to_string()],
            candidate_topic: "blocks.candidate".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_load() {
        let cfg = ConsensusConfig::try_load(&Config::default()).unwrap();
        assert_eq!(cfg.max_block_gap, 9);
        assert_eq!(cfg.sync_window, 4);
        assert_eq!(cfg.validator_address, None);
        assert_eq!(cfg.gossip_topics.len(), 2);
    }

    #[test]
    fn caller_config_overrides_defaults() {
        let overrides = Config::builder()
            .set_override("sync-window", 8)
            .unwrap()
            .set_override("validator-address", "alice")
            .unwrap()
            .build()
            .unwrap();
        let cfg = ConsensusConfig::try_load(&overrides).unwrap();
        assert_eq!(cfg.sync_window, 8);
        assert_eq!(cfg.validator_address, Some(Address::new("alice")));
        assert!(cfg.is_local_validator(Some(&Address::new("alice"))));
        assert!(!cfg.is_local_validator(Some(&Address::new("bob"))));
    }

    #[test]
    fn defaults_match_embedded_file() {
        let loaded = ConsensusConfig::try_load(&Config::default()).unwrap();
        let built = ConsensusConfig::default();
        assert_eq!(loaded.target_block_time_ms, built.target_block_time_ms);
        assert_eq!(loaded.snapshot_interval, built.snapshot_interval);
        assert_eq!(loaded.initial_reward, built.initial_reward);
        assert_eq!(loaded.gossip_topics, built.gossip_topics);
        assert_eq!(loaded.candidate_topic, built.candidate_topic);
    }
}
