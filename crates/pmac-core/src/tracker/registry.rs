//! Tracker registry -- the configured adapters for one pass, keyed by kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::trait_def::TrackerAdapter;
use super::types::TrackerKind;

/// The adapters taking part in a sync, iterated in [`TrackerKind`] order.
#[derive(Default, Clone)]
pub struct TrackerRegistry {
    trackers: BTreeMap<TrackerKind, Arc<dyn TrackerAdapter>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own [`TrackerAdapter::kind`].
    ///
    /// Returns the adapter it replaced, if any.
    pub fn register(
        &mut self,
        tracker: Arc<dyn TrackerAdapter>,
    ) -> Option<Arc<dyn TrackerAdapter>> {
        self.trackers.insert(tracker.kind(), tracker)
    }

    pub fn get(&self, kind: TrackerKind) -> Option<Arc<dyn TrackerAdapter>> {
        self.trackers.get(&kind).cloned()
    }

    /// Registered kinds, GitHub before Jira.
    pub fn kinds(&self) -> Vec<TrackerKind> {
        self.trackers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackerKind, &Arc<dyn TrackerAdapter>)> {
        self.trackers.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("trackers", &self.kinds())
            .finish()
    }
}
