//! Liveness watchdog.
//!
//! Runs on its own timer and never touches chain state: when the scheduler
//! has been quiet for too long it pushes a sync or a fork-choice check to
//! the front of the queue and lets the drain loop do the rest.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::scheduler::SchedulerHandle;
use crate::task::Task;

/// When the scheduler last made progress
#[derive(Debug, Clone, Copy)]
pub struct HealthState {
    pub last_digest: Instant,
    pub last_sync: Instant,
    pub last_reorg_check: Instant,
}

impl HealthState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_digest: now,
            last_sync: now,
            last_reorg_check: now,
        }
    }

    pub fn record_digest(&mut self, now: Instant) {
        self.last_digest = now;
    }

    pub fn record_sync(&mut self, now: Instant) {
        self.last_sync = now;
    }

    pub fn record_reorg_check(&mut self, now: Instant) {
        self.last_reorg_check = now;
    }

    fn last_progress(&self) -> Instant {
        self.last_digest.max(self.last_sync)
    }
}

/// Health state shared between the scheduler (writer) and the monitor
pub type SharedHealth = Arc<Mutex<HealthState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Sync,
    ReorgCheck,
}

/// Decide what, if anything, the scheduler needs poking with
pub fn evaluate(state: &HealthState, now: Instant, target_block_time: Duration) -> Option<HealthAction> {
    let idle = now.saturating_duration_since(state.last_progress());
    if idle >= target_block_time.mul_f64(2.5) {
        return Some(HealthAction::Sync);
    }

    let since_check = now.saturating_duration_since(state.last_reorg_check);
    if idle >= target_block_time && since_check >= target_block_time {
        return Some(HealthAction::ReorgCheck);
    }

    None
}

pub struct HealthMonitor {
    health: SharedHealth,
    scheduler: SchedulerHandle,
    target_block_time: Duration,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        health: SharedHealth,
        scheduler: SchedulerHandle,
        target_block_time: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            health,
            scheduler,
            target_block_time,
            interval,
        }
    }

    /// Tick until the scheduler terminates
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.scheduler.is_terminated() {
                debug!("Scheduler terminated, health monitor stopping");
                return;
            }

            let state = *self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match evaluate(&state, Instant::now(), self.target_block_time) {
                Some(HealthAction::Sync) => {
                    if self.scheduler.enqueue_front(Task::SyncWithPeers) {
                        info!("No progress for too long, requesting sync");
                    }
                }
                Some(HealthAction::ReorgCheck) => {
                    if self.scheduler.enqueue_front(Task::CheckReorg) {
                        debug!("Quiet period, requesting fork-choice check");
                    }
                }
                None => {}
            }
        }
    }
}
