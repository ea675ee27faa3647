//! Recent-hour metric-id sets
//!
//! Two snapshots — the current and the previous hour — published behind a
//! lock and replaced wholesale on rotation. A snapshot is *full* when it
//! has tracked its hour from the start; only full snapshots may answer
//! queries, because a partial one would silently drop series. The set
//! created at process start is never full (ingestion before start-up is
//! unknown); every rotated-in set is.

use crate::idset::MetricIdSet;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use series_core::{MetricId, TenantId, TimeRange, MSECS_PER_HOUR};
use std::sync::Arc;
use tracing::debug;

/// Metric ids seen during one hour, per tenant
#[derive(Debug, Clone)]
pub struct HourMetricIds {
    /// The hour index (Unix milliseconds / hour)
    pub hour: i64,
    /// Whether the set has tracked the hour from its start
    pub is_full: bool,
    by_tenant: FxHashMap<TenantId, MetricIdSet>,
}

impl HourMetricIds {
    fn new(hour: i64, is_full: bool) -> Self {
        HourMetricIds {
            hour,
            is_full,
            by_tenant: FxHashMap::default(),
        }
    }

    fn add(&mut self, tenant: TenantId, metric_id: MetricId) {
        self.by_tenant.entry(tenant).or_default().add(metric_id);
    }

    /// The ids one tenant contributed this hour
    pub fn tenant_ids(&self, tenant: TenantId) -> Option<&MetricIdSet> {
        self.by_tenant.get(&tenant)
    }

    /// Ids one tenant contributed this hour
    pub fn tenant_len(&self, tenant: TenantId) -> usize {
        self.by_tenant.get(&tenant).map_or(0, |ids| ids.len())
    }

    /// Total ids across tenants
    pub fn len(&self) -> usize {
        self.by_tenant.values().map(|ids| ids.len()).sum()
    }

    /// Whether no ids were tracked
    pub fn is_empty(&self) -> bool {
        self.by_tenant.is_empty()
    }
}

struct HourState {
    cur: Arc<HourMetricIds>,
    prev: Arc<HourMetricIds>,
}

/// The current/previous hour snapshots
pub struct RecentHourIndex {
    state: RwLock<HourState>,
}

impl RecentHourIndex {
    /// Create the index; the starting hour is never marked full
    pub fn new(now_ms: i64) -> Self {
        let hour = now_ms / MSECS_PER_HOUR;
        RecentHourIndex {
            state: RwLock::new(HourState {
                cur: Arc::new(HourMetricIds::new(hour, false)),
                prev: Arc::new(HourMetricIds::new(hour - 1, false)),
            }),
        }
    }

    /// Track one (tenant, id) observation
    ///
    /// Samples older than the previous hour or newer than their arrival
    /// hour are left to the per-day index.
    pub fn register(&self, tenant: TenantId, metric_id: MetricId, timestamp_ms: i64) {
        let hour = timestamp_ms / MSECS_PER_HOUR;
        let mut state = self.state.write();
        rotate_locked(&mut state, hour);
        if hour == state.cur.hour {
            Arc::make_mut(&mut state.cur).add(tenant, metric_id);
        } else if hour == state.prev.hour {
            Arc::make_mut(&mut state.prev).add(tenant, metric_id);
        }
    }

    /// The (current, previous) snapshots as of `now_ms`
    pub fn snapshot(&self, now_ms: i64) -> (Arc<HourMetricIds>, Arc<HourMetricIds>) {
        let hour = now_ms / MSECS_PER_HOUR;
        {
            let state = self.state.read();
            if hour <= state.cur.hour {
                return (Arc::clone(&state.cur), Arc::clone(&state.prev));
            }
        }
        let mut state = self.state.write();
        rotate_locked(&mut state, hour);
        (Arc::clone(&state.cur), Arc::clone(&state.prev))
    }

    /// Answer a query from the hour snapshots, if the range allows it
    ///
    /// Returns `None` when the range falls outside the tracked hours or a
    /// needed snapshot is not full; callers degrade to the per-day index.
    pub fn metric_ids_for_time_range(
        &self,
        tr: TimeRange,
        tenant: TenantId,
        now_ms: i64,
    ) -> Option<MetricIdSet> {
        let (cur, prev) = self.snapshot(now_ms);
        let (min_hour, max_hour) = tr.hour_range();

        if min_hour == cur.hour && max_hour == cur.hour && cur.is_full {
            return Some(cur.tenant_ids(tenant).cloned().unwrap_or_default());
        }
        if min_hour == prev.hour && max_hour == cur.hour && prev.is_full && cur.is_full {
            let mut ids = prev.tenant_ids(tenant).cloned().unwrap_or_default();
            if let Some(cur_ids) = cur.tenant_ids(tenant) {
                ids.union(cur_ids);
            }
            return Some(ids);
        }
        if min_hour == prev.hour && max_hour == prev.hour && prev.is_full {
            return Some(prev.tenant_ids(tenant).cloned().unwrap_or_default());
        }
        None
    }
}

fn rotate_locked(state: &mut HourState, hour: i64) {
    if hour <= state.cur.hour {
        return;
    }
    if hour == state.cur.hour + 1 {
        state.prev = Arc::clone(&state.cur);
    } else {
        // A gap: nothing was tracked for the hour before the new one.
        state.prev = Arc::new(HourMetricIds::new(hour - 1, false));
    }
    // Rotation happens before the first observation of the new hour, so
    // the new current set covers its hour from the start.
    state.cur = Arc::new(HourMetricIds::new(hour, true));
    debug!(hour, "rotated recent-hour metric id sets");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new(1, 2)
    }

    #[test]
    fn test_initial_snapshot_is_not_full() {
        let index = RecentHourIndex::new(10 * MSECS_PER_HOUR);
        let (cur, prev) = index.snapshot(10 * MSECS_PER_HOUR);
        assert_eq!(cur.hour, 10);
        assert_eq!(prev.hour, 9);
        assert!(!cur.is_full);
        assert!(!prev.is_full);
    }

    #[test]
    fn test_rotation_marks_new_hour_full() {
        let index = RecentHourIndex::new(10 * MSECS_PER_HOUR);
        index.register(tenant(), 1, 10 * MSECS_PER_HOUR + 5);
        let (cur, prev) = index.snapshot(11 * MSECS_PER_HOUR);
        assert_eq!(cur.hour, 11);
        assert!(cur.is_full);
        assert_eq!(prev.hour, 10);
        assert!(!prev.is_full); // process-start hour stays partial
        assert_eq!(prev.tenant_len(tenant()), 1);
    }

    #[test]
    fn test_gap_rotation_resets_previous() {
        let index = RecentHourIndex::new(10 * MSECS_PER_HOUR);
        index.register(tenant(), 1, 10 * MSECS_PER_HOUR);
        let (cur, prev) = index.snapshot(15 * MSECS_PER_HOUR);
        assert_eq!(cur.hour, 15);
        assert!(cur.is_full);
        assert_eq!(prev.hour, 14);
        assert!(!prev.is_full);
        assert!(prev.is_empty());
    }

    #[test]
    fn test_query_current_hour_requires_full() {
        let now = 10 * MSECS_PER_HOUR;
        let index = RecentHourIndex::new(now);
        index.register(tenant(), 7, now);
        let tr = TimeRange::new(now, now + 1000);
        // Start-up hour is partial: no fast path.
        assert!(index.metric_ids_for_time_range(tr, tenant(), now).is_none());

        // After rotation the new current hour answers directly.
        let now = 11 * MSECS_PER_HOUR;
        index.register(tenant(), 8, now);
        let tr = TimeRange::new(now, now + 1000);
        let ids = index.metric_ids_for_time_range(tr, tenant(), now).unwrap();
        assert_eq!(ids.to_vec(), vec![8]);
    }

    #[test]
    fn test_query_spanning_both_hours() {
        let start = 10 * MSECS_PER_HOUR;
        let index = RecentHourIndex::new(start);
        // Hour 11 and 12 are both fully tracked.
        index.register(tenant(), 1, 11 * MSECS_PER_HOUR);
        index.register(tenant(), 2, 12 * MSECS_PER_HOUR);
        let tr = TimeRange::new(11 * MSECS_PER_HOUR, 12 * MSECS_PER_HOUR + 500);
        let ids = index
            .metric_ids_for_time_range(tr, tenant(), 12 * MSECS_PER_HOUR + 500)
            .unwrap();
        assert_eq!(ids.to_vec(), vec![1, 2]);
    }

    #[test]
    fn test_query_filters_by_tenant() {
        let index = RecentHourIndex::new(10 * MSECS_PER_HOUR);
        let now = 11 * MSECS_PER_HOUR;
        index.register(TenantId::new(1, 2), 1, now);
        index.register(TenantId::new(3, 4), 2, now);
        let tr = TimeRange::new(now, now);
        let ids = index
            .metric_ids_for_time_range(tr, TenantId::new(1, 2), now)
            .unwrap();
        assert_eq!(ids.to_vec(), vec![1]);
    }

    #[test]
    fn test_query_outside_window_misses() {
        let index = RecentHourIndex::new(10 * MSECS_PER_HOUR);
        let now = 12 * MSECS_PER_HOUR;
        index.register(tenant(), 1, now);
        // Three-hour span cannot be served from two snapshots.
        let tr = TimeRange::new(9 * MSECS_PER_HOUR, now);
        assert!(index.metric_ids_for_time_range(tr, tenant(), now).is_none());
    }

    #[test]
    fn test_late_sample_lands_in_previous_hour() {
        let index = RecentHourIndex::new(10 * MSECS_PER_HOUR);
        index.register(tenant(), 1, 11 * MSECS_PER_HOUR); // rotates to 11
        index.register(tenant(), 2, 12 * MSECS_PER_HOUR); // rotates to 12
        index.register(tenant(), 3, 11 * MSECS_PER_HOUR + 100); // late
        let (_, prev) = index.snapshot(12 * MSECS_PER_HOUR);
        assert_eq!(prev.tenant_ids(tenant()).unwrap().to_vec(), vec![1, 3]);
    }
}
