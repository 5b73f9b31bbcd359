//! Observer trait for consensus events.

use std::sync::Arc;

use meridian_common::BlockHeader;

/// Callback receiver for consensus events.
///
/// Callbacks run on the drain loop, so implementations should hand the
/// event off (to a channel, a message bus) rather than do work inline.
pub trait ConsensusObserver: Send + Sync {
    /// A block was accepted onto the local chain.
    ///
    /// Called in strictly ascending height order between rollbacks.
    fn block_confirmed(&self, header: &BlockHeader);

    /// The local validator produced and broadcast a candidate.
    fn candidate_created(&self, header: &BlockHeader);

    /// The chain was rolled back; everything above `height` is gone.
    fn rolled_back(&self, height: u64);
}

/// The registered observers, notified in registration order
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn ConsensusObserver>>);

impl Observers {
    pub fn new(observers: Vec<Arc<dyn ConsensusObserver>>) -> Self {
        Self(observers)
    }

    pub fn block_confirmed(&self, header: &BlockHeader) {
        self.0.iter().for_each(|o| o.block_confirmed(header));
    }

    pub fn candidate_created(&self, header: &BlockHeader) {
        self.0.iter().for_each(|o| o.candidate_created(header));
    }

    pub fn rolled_back(&self, height: u64) {
        self.0.iter().for_each(|o| o.rolled_back(height));
    }
}
