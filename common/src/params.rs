//! Protocol parameters the consensus core relies on

/// How far ahead of the tip a block may be before it is treated as a sign
/// that we are behind and need a sync rather than a reorg check
pub const MAX_BLOCK_GAP: u64 = 9;

/// Blocks between state snapshots
pub const SNAPSHOT_INTERVAL: u64 = 5;

/// Snapshots above `height - SYNC_FAILURE_SNAPSHOT_MARGIN` are discarded
/// when a sync fails, so the restarted node does not trust that prefix
pub const SYNC_FAILURE_SNAPSHOT_MARGIN: u64 = 10;

/// Target time between blocks (ms)
pub const TARGET_BLOCK_TIME_MS: u64 = 120_000;
