//! In-memory tombstone set
//!
//! An immutable id set published behind an atomically swapped pointer.
//! Readers grab the current snapshot without blocking; writers serialize
//! on a dedicated mutex, clone, extend and republish. After a rollover
//! the set holds the union of the current and previous generation's
//! tombstones.

use crate::idset::MetricIdSet;
use parking_lot::{Mutex, RwLock};
use series_core::MetricId;
use std::sync::Arc;

/// Copy-on-write tombstone set
#[derive(Default)]
pub struct DeletedSet {
    ids: RwLock<Arc<MetricIdSet>>,
    update_lock: Mutex<()>,
}

impl DeletedSet {
    /// The current immutable snapshot
    pub fn snapshot(&self) -> Arc<MetricIdSet> {
        Arc::clone(&self.ids.read())
    }

    /// Whether `metric_id` is tombstoned
    pub fn contains(&self, metric_id: MetricId) -> bool {
        self.ids.read().has(metric_id)
    }

    /// Number of tombstoned ids
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    /// Whether no ids are tombstoned
    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Merge `new_ids` into the published set
    pub fn add_all(&self, new_ids: &MetricIdSet) {
        if new_ids.is_empty() {
            return;
        }
        let _guard = self.update_lock.lock();
        let mut next = (**self.ids.read()).clone();
        next.union(new_ids);
        *self.ids.write() = Arc::new(next);
    }
}
