//! Reconciler: three-way comparison of plan content, mapping base, and
//! remote state.
//!
//! For every (entity, tracker) pair the reconciler resolves the remote
//! record, compares `content_hash`, `base_hash` and `remote_hash`, and emits
//! either a [`Change`], a [`Conflict`], an [`EntityFailure`], or nothing.
//! Output is ordered by (entity kind, id, tracker): epics before stories,
//! stories before sprints, sprints before views.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, FieldSet};
use crate::mapping::{MappingEntry, MappingTable, PairKey};
use crate::plan::{EntityKey, PlanEntity};
use crate::tracker::transport::with_deadline;
use crate::tracker::{IssueFilter, Lookup, RemoteRecord, TrackerAdapter, TrackerError, TrackerRegistry};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What the three hashes say about one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    InSync,
    /// No remote counterpart (or it vanished).
    Create,
    /// Remote already matches the plan; record it, no remote call.
    Adopt,
    /// Plan changed (or the matched remote differs): write plan values.
    Push,
    /// Only the remote changed.
    Pull,
    /// Both changed differently.
    Conflict,
}

/// Three-way comparison. `base` is `None` without a mapping entry, `remote`
/// is `None` when no remote counterpart was found.
pub fn classify(
    content: &ContentHash,
    base: Option<&ContentHash>,
    remote: Option<&ContentHash>,
) -> Verdict {
    let Some(remote) = remote else {
        return Verdict::Create;
    };
    let Some(base) = base else {
        return if remote == content {
            Verdict::Adopt
        } else {
            Verdict::Push
        };
    };
    match (content == base, remote == base) {
        (true, true) => Verdict::InSync,
        (false, true) => Verdict::Push,
        (true, false) => Verdict::Pull,
        (false, false) if content == remote => Verdict::Adopt,
        (false, false) => Verdict::Conflict,
    }
}

/// How a remote-only change is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundPolicy {
    /// Merge the remote values into the plan.
    #[default]
    PullMerge,
    /// Report it as a conflict for the resolver.
    Conflict,
}

impl FromStr for InboundPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull_merge" => Ok(InboundPolicy::PullMerge),
            "conflict" => Ok(InboundPolicy::Conflict),
            other => Err(format!(
                "unknown inbound policy {other:?} (expected pull_merge or conflict)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Changes and conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelinkDirection {
    /// Remote already agrees with the plan.
    Adopt,
    /// Remote values flow into the plan.
    Pull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Create,
    Update {
        remote_id: String,
    },
    /// Mapping-only: record `remote_hash` as the new base.
    Relink {
        remote_id: String,
        direction: RelinkDirection,
        remote_hash: ContentHash,
    },
    /// Drop the mapping entry. Only ever requested explicitly.
    Unlink {
        remote_id: String,
    },
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update { .. } => "update",
            ChangeKind::Relink {
                direction: RelinkDirection::Adopt,
                ..
            } => "adopt",
            ChangeKind::Relink {
                direction: RelinkDirection::Pull,
                ..
            } => "pull",
            ChangeKind::Unlink { .. } => "unlink",
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            ChangeKind::Create => None,
            ChangeKind::Update { remote_id }
            | ChangeKind::Relink { remote_id, .. }
            | ChangeKind::Unlink { remote_id } => Some(remote_id),
        }
    }
}

/// An intended mutation of one (entity, tracker) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub pair: PairKey,
    pub kind: ChangeKind,
    /// Values to write: the plan's, or the remote's for a pull.
    pub fields: FieldSet,
    /// Names of the logical fields that differ.
    pub changed: Vec<&'static str>,
    /// A story's epic.
    pub parent: Option<EntityKey>,
    /// Stories a view places on its board.
    pub members: Vec<EntityKey>,
    /// Base hash of the mapping entry this change was computed against;
    /// `None` when the pair was unlinked.
    pub expected_base: Option<ContentHash>,
}

/// Both sides changed one pair since the last sync, and disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub pair: PairKey,
    pub remote_id: String,
    pub plan_fields: FieldSet,
    pub remote_fields: FieldSet,
    pub content_hash: ContentHash,
    pub remote_hash: ContentHash,
    pub base_hash: ContentHash,
    pub plan_modified_at: Option<DateTime<Utc>>,
    /// `None` when the tracker reports no modification time.
    pub remote_seen_at: Option<DateTime<Utc>>,
    pub parent: Option<EntityKey>,
    pub members: Vec<EntityKey>,
}

/// A pair left out of the batch because its remote lookup failed.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFailure {
    pub pair: PairKey,
    pub error: TrackerError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutput {
    pub changes: Vec<Change>,
    pub conflicts: Vec<Conflict>,
    pub failures: Vec<EntityFailure>,
}

impl ReconcileOutput {
    fn extend(&mut self, other: ReconcileOutput) {
        self.changes.extend(other.changes);
        self.conflicts.extend(other.conflicts);
        self.failures.extend(other.failures);
    }

    fn sort(&mut self) {
        self.changes.sort_by(|a, b| a.pair.cmp(&b.pair));
        self.conflicts.sort_by(|a, b| a.pair.cmp(&b.pair));
        self.failures.sort_by(|a, b| a.pair.cmp(&b.pair));
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub inbound_policy: InboundPolicy,
    /// Bound on each remote call (one listing page, one lookup).
    pub call_timeout: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            inbound_policy: InboundPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Reconciler<'a> {
    trackers: &'a TrackerRegistry,
    mapping: &'a MappingTable,
    options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        trackers: &'a TrackerRegistry,
        mapping: &'a MappingTable,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            trackers,
            mapping,
            options,
        }
    }

    /// Compare every plan entity against every registered tracker.
    ///
    /// Trackers are examined concurrently. A failing lookup excludes only
    /// its own pair.
    pub async fn reconcile(&self, entities: &[PlanEntity]) -> ReconcileOutput {
        let base = self.mapping.snapshot();
        let per_tracker = self
            .trackers
            .iter()
            .map(|(_, tracker)| self.reconcile_tracker(Arc::clone(tracker), entities, &base));
        let mut output = ReconcileOutput::default();
        for part in futures::future::join_all(per_tracker).await {
            output.extend(part);
        }
        output.sort();
        tracing::info!(
            changes = output.changes.len(),
            conflicts = output.conflicts.len(),
            failures = output.failures.len(),
            "reconciled plan"
        );
        output
    }

    async fn reconcile_tracker(
        &self,
        tracker: Arc<dyn TrackerAdapter>,
        entities: &[PlanEntity],
        base: &BTreeMap<PairKey, MappingEntry>,
    ) -> ReconcileOutput {
        let kind = tracker.kind();
        let mut output = ReconcileOutput::default();

        let needs_snapshot = entities.iter().any(|e| e.key.kind.is_issue());
        let snapshot = if needs_snapshot {
            self.fetch_snapshot(tracker.as_ref()).await
        } else {
            Ok(HashMap::new())
        };
        if let Err(err) = &snapshot {
            tracing::warn!(tracker = %kind, error = %err, "failed to list remote issues");
        }

        for entity in entities {
            let pair = PairKey::new(entity.key.clone(), kind);
            let mapped = base.get(&pair);

            let remote = if entity.key.kind.is_issue() {
                match &snapshot {
                    Ok(snapshot) => {
                        let listed = mapped.and_then(|m| snapshot.get(&m.remote_id)).cloned();
                        match listed {
                            Some(record) => Ok(Some(record)),
                            None => self.lookup(tracker.as_ref(), entity, mapped).await,
                        }
                    }
                    Err(err) => Err(err.clone()),
                }
            } else {
                self.lookup(tracker.as_ref(), entity, mapped).await
            };

            let remote = match remote {
                Ok(remote) => remote,
                Err(error) => {
                    tracing::warn!(pair = %pair, error = %error, "excluding pair from this pass");
                    output.failures.push(EntityFailure { pair, error });
                    continue;
                }
            };

            let content = tracker.representable_fields(entity.key.kind, &entity.fields);
            self.compare(pair, entity, &content, mapped, remote, &mut output);
        }
        output
    }

    async fn fetch_snapshot(
        &self,
        tracker: &dyn TrackerAdapter,
    ) -> Result<HashMap<String, RemoteRecord>, TrackerError> {
        let filter = IssueFilter::all();
        let mut stream = tracker.list_issues(&filter);
        let mut records = HashMap::new();
        loop {
            let next = with_deadline(tracker.kind(), self.options.call_timeout, async {
                Ok(stream.next().await)
            })
            .await?;
            match next {
                Some(record) => {
                    let record = record?;
                    records.insert(record.remote_id.clone(), record);
                }
                None => break,
            }
        }
        tracing::debug!(tracker = %tracker.kind(), issues = records.len(), "listed remote issues");
        Ok(records)
    }

    /// Find the remote counterpart; `NotFound` means there is none.
    async fn lookup(
        &self,
        tracker: &dyn TrackerAdapter,
        entity: &PlanEntity,
        mapped: Option<&MappingEntry>,
    ) -> Result<Option<RemoteRecord>, TrackerError> {
        let lookup = Lookup {
            kind: entity.key.kind,
            plan_id: entity.key.id.clone(),
            title: entity.fields.title.clone(),
            key: mapped.map(|m| m.remote_id.clone()),
        };
        let found = with_deadline(
            tracker.kind(),
            self.options.call_timeout,
            tracker.find_by_title_or_key(&lookup),
        )
        .await;
        match found {
            // A title match that belongs to another plan entity is not ours.
            Ok(record)
                if record
                    .plan_id
                    .as_deref()
                    .is_some_and(|id| id != entity.key.id) =>
            {
                Ok(None)
            }
            Ok(record) => Ok(Some(record)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn compare(
        &self,
        pair: PairKey,
        entity: &PlanEntity,
        content: &FieldSet,
        mapped: Option<&MappingEntry>,
        remote: Option<RemoteRecord>,
        output: &mut ReconcileOutput,
    ) {
        let content_hash = content.digest();
        let verdict = classify(
            &content_hash,
            mapped.map(|m| &m.base_hash),
            remote.as_ref().map(|r| &r.remote_hash),
        );
        tracing::debug!(pair = %pair, verdict = ?verdict, "classified pair");

        let change = |kind: ChangeKind, fields: FieldSet, changed: Vec<&'static str>| Change {
            pair: pair.clone(),
            kind,
            fields,
            changed,
            parent: entity.parent.clone(),
            members: entity.members.clone(),
            expected_base: mapped.map(|m| m.base_hash.clone()),
        };

        let remote = match (verdict, remote) {
            (Verdict::InSync, _) => return,
            (Verdict::Create, _) => {
                output.changes.push(change(
                    ChangeKind::Create,
                    entity.fields.clone(),
                    content.populated(),
                ));
                return;
            }
            (_, Some(remote)) => remote,
            // Every other verdict implies a remote record.
            (_, None) => return,
        };

        match verdict {
            Verdict::Adopt => output.changes.push(change(
                ChangeKind::Relink {
                    remote_id: remote.remote_id,
                    direction: RelinkDirection::Adopt,
                    remote_hash: remote.remote_hash,
                },
                entity.fields.clone(),
                Vec::new(),
            )),
            Verdict::Push => output.changes.push(change(
                ChangeKind::Update {
                    remote_id: remote.remote_id,
                },
                entity.fields.clone(),
                content.diff(&remote.fields),
            )),
            Verdict::Pull if self.options.inbound_policy == InboundPolicy::PullMerge => {
                let changed = remote.fields.diff(content);
                output.changes.push(change(
                    ChangeKind::Relink {
                        remote_id: remote.remote_id,
                        direction: RelinkDirection::Pull,
                        remote_hash: remote.remote_hash,
                    },
                    remote.fields,
                    changed,
                ))
            }
            Verdict::Pull | Verdict::Conflict => {
                let Some(mapped) = mapped else { return };
                output.conflicts.push(Conflict {
                    pair,
                    remote_id: remote.remote_id,
                    plan_fields: entity.fields.clone(),
                    remote_fields: remote.fields,
                    content_hash,
                    remote_hash: remote.remote_hash,
                    base_hash: mapped.base_hash.clone(),
                    plan_modified_at: entity.modified_at,
                    remote_seen_at: remote.last_seen_at,
                    parent: entity.parent.clone(),
                    members: entity.members.clone(),
                })
            }
            Verdict::InSync | Verdict::Create => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> ContentHash {
        ContentHash(s.to_string())
    }

    #[test]
    fn no_mapping_no_remote_creates() {
        assert_eq!(classify(&h("c"), None, None), Verdict::Create);
    }

    #[test]
    fn no_mapping_with_matching_remote_adopts() {
        assert_eq!(classify(&h("c"), None, Some(&h("c"))), Verdict::Adopt);
        assert_eq!(classify(&h("c"), None, Some(&h("r"))), Verdict::Push);
    }

    #[test]
    fn vanished_remote_recreates() {
        assert_eq!(classify(&h("c"), Some(&h("b")), None), Verdict::Create);
    }

    #[test]
    fn three_way_table() {
        let b = h("b");
        assert_eq!(classify(&b, Some(&b), Some(&b)), Verdict::InSync);
        assert_eq!(classify(&h("c"), Some(&b), Some(&b)), Verdict::Push);
        assert_eq!(classify(&b, Some(&b), Some(&h("r"))), Verdict::Pull);
        assert_eq!(classify(&h("x"), Some(&b), Some(&h("x"))), Verdict::Adopt);
        assert_eq!(classify(&h("c"), Some(&b), Some(&h("r"))), Verdict::Conflict);
    }

    #[test]
    fn inbound_policy_parses() {
        assert_eq!("conflict".parse(), Ok(InboundPolicy::Conflict));
        assert_eq!(InboundPolicy::default(), InboundPolicy::PullMerge);
        assert!("merge".parse::<InboundPolicy>().is_err());
    }

    #[test]
    fn change_labels() {
        let relink = ChangeKind::Relink {
            remote_id: "1".to_string(),
            direction: RelinkDirection::Pull,
            remote_hash: h("r"),
        };
        assert_eq!(relink.label(), "pull");
        assert_eq!(relink.remote_id(), Some("1"));
        assert_eq!(ChangeKind::Create.remote_id(), None);
    }
}
