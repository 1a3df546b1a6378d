//! Tests for the tracker registry.

use std::sync::Arc;

use pmac_core::tracker::{TrackerAdapter, TrackerKind, TrackerRegistry};
use pmac_test_utils::FakeTracker;

#[test]
fn empty_registry() {
    let registry = TrackerRegistry::new();
    assert!(registry.is_empty());
    assert_eq!(registry.len(), 0);
    assert!(registry.get(TrackerKind::GitHub).is_none());
    assert!(registry.kinds().is_empty());
}

#[test]
fn iterates_github_before_jira_regardless_of_registration_order() {
    let mut registry = TrackerRegistry::new();
    registry.register(FakeTracker::shared(TrackerKind::Jira));
    registry.register(FakeTracker::shared(TrackerKind::GitHub));

    assert_eq!(registry.kinds(), vec![TrackerKind::GitHub, TrackerKind::Jira]);
    let order: Vec<TrackerKind> = registry.iter().map(|(kind, _)| kind).collect();
    assert_eq!(order, vec![TrackerKind::GitHub, TrackerKind::Jira]);
    assert_eq!(format!("{registry:?}"), "TrackerRegistry { trackers: [GitHub, Jira] }");
}

#[test]
fn registering_the_same_kind_replaces_the_adapter() {
    let first: Arc<dyn TrackerAdapter> = FakeTracker::shared(TrackerKind::GitHub);
    let second: Arc<dyn TrackerAdapter> = FakeTracker::shared(TrackerKind::GitHub);
    let mut registry = TrackerRegistry::new();

    assert!(registry.register(first.clone()).is_none());
    let replaced = registry.register(second.clone()).expect("replaced");

    assert!(Arc::ptr_eq(&replaced, &first));
    let current = registry.get(TrackerKind::GitHub).expect("registered");
    assert!(Arc::ptr_eq(&current, &second));
    assert_eq!(registry.len(), 1);
}
