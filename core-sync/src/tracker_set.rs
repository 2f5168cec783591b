use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Trackers grouped by file id or by (parent tracker, title).
///
/// At most one member is active at a time; the set records which one so the
/// "is anything here active" question never needs a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSet {
    tracker_ids: BTreeSet<i64>,
    active_tracker: Option<i64>,
}

impl TrackerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tracker_id: i64, active: bool) {
        self.tracker_ids.insert(tracker_id);
        if active {
            self.active_tracker = Some(tracker_id);
        }
    }

    pub fn erase(&mut self, tracker_id: i64) {
        self.tracker_ids.remove(&tracker_id);
        if self.active_tracker == Some(tracker_id) {
            self.active_tracker = None;
        }
    }

    /// Mark `tracker_id` as the active member. It must already be in the set.
    pub fn activate(&mut self, tracker_id: i64) {
        debug_assert!(self.tracker_ids.contains(&tracker_id));
        self.active_tracker = Some(tracker_id);
    }

    pub fn inactivate(&mut self, tracker_id: i64) {
        if self.active_tracker == Some(tracker_id) {
            self.active_tracker = None;
        }
    }

    pub fn has_active(&self) -> bool {
        self.active_tracker.is_some()
    }

    pub fn active_tracker(&self) -> Option<i64> {
        self.active_tracker
    }

    pub fn contains(&self, tracker_id: i64) -> bool {
        self.tracker_ids.contains(&tracker_id)
    }

    pub fn len(&self) -> usize {
        self.tracker_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker_ids.is_empty()
    }

    /// Member ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.tracker_ids.iter().copied()
    }
}
