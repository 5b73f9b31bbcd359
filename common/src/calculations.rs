//! Reward schedule and proof target calculations

/// Coinbase reward for the block following `parent_index`.
///
/// Halves every `halving_interval` blocks; zero after 64 halvings.
pub fn block_reward(parent_index: u64, initial_reward: u64, halving_interval: u64) -> u64 {
    if halving_interval == 0 {
        return initial_reward;
    }
    let halvings = (parent_index + 1) / halving_interval;
    if halvings >= 64 {
        0
    } else {
        initial_reward >> halvings
    }
}

/// Split a coinbase into (PoS validator share, PoW miner share).
///
/// The validator also collects the fees. Rounding favours the miner.
/// `None` if the validator share overflows.
pub fn reward_split(coin_base: u64, fees: u64, pos_percent: u8) -> Option<(u64, u64)> {
    let percent = u128::from(pos_percent.min(100));
    let pos = u64::try_from(u128::from(coin_base) * percent / 100).ok()?;
    Some((pos.checked_add(fees)?, coin_base - pos))
}

/// Difficulty a block's proof hash must meet, in leading zero bits.
///
/// Less legitimate validators (higher legitimacy rank) face a harder
/// target; the target decays as time passes after the candidate was
/// assembled so a round can never stall.
pub fn final_difficulty(
    base_difficulty: u32,
    legitimacy: u32,
    pos_timestamp: u64,
    timestamp: u64,
    decay_ms: u64,
) -> u32 {
    let elapsed = timestamp.saturating_sub(pos_timestamp);
    let time_adjustment = if decay_ms == 0 { 0 } else { elapsed / decay_ms };
    let adjustment = u32::try_from(time_adjustment).unwrap_or(u32::MAX);
    base_difficulty.saturating_add(legitimacy).saturating_sub(adjustment)
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_halves_on_schedule() {
        assert_eq!(block_reward(0, 256, 10), 256);
        assert_eq!(block_reward(8, 256, 10), 256);
        assert_eq!(block_reward(9, 256, 10), 128);
        assert_eq!(block_reward(29, 256, 10), 32);
    }

    #[test]
    fn reward_runs_out() {
        assert_eq!(block_reward(10_000, 256, 10), 0);
    }

    #[test]
    fn split_gives_fees_to_validator() {
        assert_eq!(reward_split(100, 7, 50), Some((57, 50)));
        assert_eq!(reward_split(101, 0, 50), Some((50, 51)));
        assert_eq!(reward_split(100, 0, 0), Some((0, 100)));
    }

    #[test]
    fn split_refuses_overflowing_fees() {
        assert_eq!(reward_split(100, u64::MAX, 50), None);
        assert_eq!(reward_split(100, u64::MAX - 50, 50), Some((u64::MAX, 50)));
    }

    #[test]
    fn difficulty_grows_with_legitimacy_and_decays_with_time() {
        assert_eq!(final_difficulty(10, 2, 1_000, 1_000, 500), 12);
        assert_eq!(final_difficulty(10, 2, 1_000, 3_000, 500), 8);
        assert_eq!(final_difficulty(1, 0, 0, 1_000_000, 500), 0);
    }
}
