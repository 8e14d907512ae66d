use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;

use super::rates::RateSnapshot;

/// Holds the current rate snapshot behind a single atomically swapped
/// pointer. Reads never block and never see a half-built snapshot.
///
/// The cache has no staleness policy of its own; callers compare
/// [`RateSnapshot::fetched_at`] against their TTL.
pub struct RateCache {
    current: ArcSwap<RateSnapshot>,
}

impl RateCache {
    /// The cache is never empty: it starts with `seed`.
    pub fn new(seed: Arc<RateSnapshot>) -> Self {
        Self {
            current: ArcSwap::new(seed),
        }
    }

    pub fn read(&self) -> Arc<RateSnapshot> {
        self.current.load_full()
    }

    pub fn write(&self, snapshot: Arc<RateSnapshot>) {
        debug!(
            source = %snapshot.source(),
            fetched_at = %snapshot.fetched_at(),
            "Cache PUT"
        );
        self.current.store(snapshot);
    }
}
