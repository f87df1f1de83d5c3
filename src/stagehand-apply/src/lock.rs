//! Per-feature exclusive leases.
//!
//! Applies and reverts of the same feature are serialized in-process so two
//! callers can never allocate the same batch index. Different features
//! proceed in parallel. There is no cross-process locking.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Lock table keyed by feature id. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct FeatureLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one apply or revert.
///
/// Dropping the last guard of a feature nobody is waiting on removes its
/// entry from the table.
pub struct FeatureGuard {
    guard: Option<OwnedMutexGuard<()>>,
    feature: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for FeatureGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, so a count of one means only the
        // table references it.
        self.locks
            .remove_if(&self.feature, |_, lock| Arc::strong_count(lock) == 1);
        trace!(feature = %self.feature, "Feature lock released");
    }
}

impl FeatureLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `feature`.
    pub async fn acquire(&self, feature: &str) -> FeatureGuard {
        let lock = self
            .locks
            .entry(feature.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        trace!(feature, "Feature lock acquired");
        FeatureGuard {
            guard: Some(guard),
            feature: feature.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Whether `feature` is held or has a caller waiting for it.
    pub fn is_locked(&self, feature: &str) -> bool {
        self.locks.contains_key(feature)
    }
}
