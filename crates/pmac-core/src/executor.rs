//! Sync executor: applies a resolved change set through the adapters.
//!
//! Changes for one tracker run serially, in change-set order; the trackers
//! run concurrently. Within a tracker:
//! - transient failures retry with backoff, then fail that change only;
//! - a rate limit past the wait bound defers that change and every later
//!   change for the tracker;
//! - an auth failure fails that change and skips the rest of the tracker.
//!
//! A mapping entry is committed only after the remote call succeeded.
//! Nothing is rolled back. A change whose pair's mapping entry moved after
//! reconciliation is skipped as stale. A create retried after a failure
//! first looks for the record the failed attempt may have left behind.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::mapping::{MappingEntry, MappingError, MappingTable, PairClaim, PairKey};
use crate::plan::{EntityKey, EntityKind};
use crate::reconcile::{Change, ChangeKind};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tracker::transport::with_deadline;
use crate::tracker::{
    ArtifactDraft, ErrorKind, IssueDraft, Lookup, ParentLink, RemoteRecord, TrackerAdapter,
    TrackerError, TrackerKind, TrackerRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The pass was cancelled before this change ran.
    Cancelled,
    /// An earlier change on the same tracker failed authentication.
    TrackerAuthFailed,
    /// The story's epic has no counterpart on this tracker yet.
    DependencyMissing(EntityKey),
    /// Another pass holds the pair's claim.
    SyncInProgress,
    /// No adapter is registered for the tracker.
    TrackerNotConfigured,
    /// The pair's mapping entry changed after the change was computed.
    Stale,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Cancelled => f.write_str("cancelled"),
            SkipReason::TrackerAuthFailed => f.write_str("tracker authentication failed"),
            SkipReason::DependencyMissing(key) => write!(f, "dependency {key} is not synced"),
            SkipReason::SyncInProgress => f.write_str("sync in progress"),
            SkipReason::TrackerNotConfigured => f.write_str("tracker not configured"),
            SkipReason::Stale => f.write_str("mapping changed since reconciliation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The remote call succeeded but the mapping entry could not be saved.
    #[error("mapping commit failed: {0}")]
    Mapping(String),
}

impl From<MappingError> for ApplyError {
    fn from(err: MappingError) -> Self {
        ApplyError::Mapping(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied {
        remote_id: String,
        /// Remote calls made; 0 for mapping-only changes.
        attempts: u32,
    },
    Failed {
        attempts: u32,
        error: ApplyError,
    },
    Deferred {
        resume_at: DateTime<Utc>,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied { .. } => "applied",
            Outcome::Failed { .. } => "failed",
            Outcome::Deferred { .. } => "deferred",
            Outcome::Skipped { .. } => "skipped",
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }
}

/// One change and what became of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeReport {
    pub change: Change,
    pub outcome: Outcome,
}

/// What a create or update writes.
enum Draft {
    Issue(IssueDraft),
    Artifact(EntityKind, ArtifactDraft),
}

/// Why a tracker lane stopped doing remote work.
#[derive(Debug, Clone, Copy)]
enum Halt {
    Auth,
    Deferred(DateTime<Utc>),
}

pub struct Executor<'a> {
    trackers: &'a TrackerRegistry,
    mapping: &'a MappingTable,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl<'a> Executor<'a> {
    pub fn new(
        trackers: &'a TrackerRegistry,
        mapping: &'a MappingTable,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            trackers,
            mapping,
            policy,
            call_timeout,
        }
    }

    /// Apply `changes`, returning one report per change in input order.
    pub async fn execute(
        &self,
        changes: Vec<Change>,
        cancel: &CancellationToken,
    ) -> Vec<ChangeReport> {
        let total = changes.len();
        let mut lanes: BTreeMap<TrackerKind, Vec<(usize, Change)>> = BTreeMap::new();
        for (idx, change) in changes.into_iter().enumerate() {
            lanes
                .entry(change.pair.tracker)
                .or_default()
                .push((idx, change));
        }

        let runs = lanes
            .into_iter()
            .map(|(kind, lane)| self.run_lane(kind, lane, cancel));
        let mut indexed: Vec<(usize, ChangeReport)> = futures::future::join_all(runs)
            .await
            .into_iter()
            .flatten()
            .collect();
        indexed.sort_by_key(|(idx, _)| *idx);
        debug_assert_eq!(indexed.len(), total);
        indexed.into_iter().map(|(_, report)| report).collect()
    }

    async fn run_lane(
        &self,
        kind: TrackerKind,
        lane: Vec<(usize, Change)>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, ChangeReport)> {
        let adapter = self.trackers.get(kind);
        let mut halted: Option<Halt> = None;
        let mut reports = Vec::with_capacity(lane.len());

        for (idx, change) in lane {
            let outcome = if cancel.is_cancelled() {
                Outcome::Skipped {
                    reason: SkipReason::Cancelled,
                }
            } else if let (Some(halt), true) = (halted, needs_remote(&change.kind)) {
                match halt {
                    Halt::Auth => Outcome::Skipped {
                        reason: SkipReason::TrackerAuthFailed,
                    },
                    Halt::Deferred(resume_at) => Outcome::Deferred { resume_at },
                }
            } else {
                self.apply(adapter.as_deref(), &change, cancel).await
            };

            match &outcome {
                Outcome::Failed {
                    error: ApplyError::Tracker(err),
                    ..
                } if err.kind() == ErrorKind::Auth => {
                    tracing::error!(tracker = %kind, error = %err, "authentication failed; skipping remaining changes");
                    halted = Some(Halt::Auth);
                }
                Outcome::Deferred { resume_at } if halted.is_none() => {
                    tracing::warn!(tracker = %kind, resume_at = %resume_at, "rate limited; deferring remaining changes");
                    halted = Some(Halt::Deferred(*resume_at));
                }
                _ => {}
            }
            tracing::info!(
                pair = %change.pair,
                change = change.kind.label(),
                outcome = outcome.label(),
                "change processed"
            );
            reports.push((idx, ChangeReport { change, outcome }));
        }
        reports
    }

    async fn apply(
        &self,
        adapter: Option<&dyn TrackerAdapter>,
        change: &Change,
        cancel: &CancellationToken,
    ) -> Outcome {
        let claim = match self.mapping.claim(change.pair.clone()) {
            Ok(claim) => claim,
            Err(err) => {
                tracing::warn!(pair = %change.pair, error = %err, "pair is claimed elsewhere");
                return Outcome::Skipped {
                    reason: SkipReason::SyncInProgress,
                };
            }
        };
        let current_base = self.mapping.get(&change.pair).map(|e| e.base_hash);
        if current_base != change.expected_base {
            tracing::warn!(pair = %change.pair, "mapping entry changed since reconciliation; skipping");
            return Outcome::Skipped {
                reason: SkipReason::Stale,
            };
        }

        match &change.kind {
            ChangeKind::Relink {
                remote_id,
                remote_hash,
                ..
            } => {
                let entry = MappingEntry {
                    remote_id: remote_id.clone(),
                    base_hash: remote_hash.clone(),
                    last_synced_at: Utc::now(),
                };
                self.commit(&claim, entry, 0)
            }
            ChangeKind::Unlink { remote_id } => match self.mapping.unlink(&claim) {
                Ok(_) => Outcome::Applied {
                    remote_id: remote_id.clone(),
                    attempts: 0,
                },
                Err(err) => Outcome::Failed {
                    attempts: 0,
                    error: err.into(),
                },
            },
            ChangeKind::Create | ChangeKind::Update { .. } => {
                let Some(adapter) = adapter else {
                    return Outcome::Skipped {
                        reason: SkipReason::TrackerNotConfigured,
                    };
                };
                let parent = match self.parent_link(change) {
                    Ok(parent) => parent,
                    Err(missing) => {
                        tracing::warn!(pair = %change.pair, epic = %missing, "epic has no remote counterpart; skipping");
                        return Outcome::Skipped {
                            reason: SkipReason::DependencyMissing(missing),
                        };
                    }
                };
                let draft = self.draft(change, parent);
                self.call_with_retry(adapter, change, &draft, &claim, cancel)
                    .await
            }
        }
    }

    /// Remote side of a story's epic. Only a create requires it.
    fn parent_link(&self, change: &Change) -> Result<Option<ParentLink>, EntityKey> {
        let Some(parent) = &change.parent else {
            return Ok(None);
        };
        let pair = PairKey::new(parent.clone(), change.pair.tracker);
        match self.mapping.get(&pair) {
            Some(entry) => Ok(Some(ParentLink {
                plan_id: parent.id.clone(),
                remote_id: entry.remote_id,
            })),
            None if change.kind == ChangeKind::Create => Err(parent.clone()),
            None => Ok(None),
        }
    }

    fn draft(&self, change: &Change, parent: Option<ParentLink>) -> Draft {
        let entity = &change.pair.entity;
        if entity.kind.is_issue() {
            Draft::Issue(IssueDraft {
                kind: entity.kind,
                plan_id: entity.id.clone(),
                fields: change.fields.clone(),
                parent,
            })
        } else {
            Draft::Artifact(
                entity.kind,
                ArtifactDraft {
                    plan_id: entity.id.clone(),
                    fields: change.fields.clone(),
                    items: self.member_items(change),
                },
            )
        }
    }

    /// Remote ids of a view's stories on this tracker. Unsynced stories are
    /// left off the board.
    fn member_items(&self, change: &Change) -> Vec<String> {
        change
            .members
            .iter()
            .filter_map(|story| {
                let pair = PairKey::new(story.clone(), change.pair.tracker);
                let entry = self.mapping.get(&pair);
                if entry.is_none() {
                    tracing::debug!(pair = %change.pair, story = %story, "story has no remote counterpart; not placing it");
                }
                entry.map(|e| e.remote_id)
            })
            .collect()
    }

    async fn call_with_retry(
        &self,
        adapter: &dyn TrackerAdapter,
        change: &Change,
        draft: &Draft,
        claim: &PairClaim,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut target = change.kind.remote_id().map(str::to_string);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = with_deadline(
                adapter.kind(),
                self.call_timeout,
                self.attempt(adapter, change, draft, &mut target, attempt),
            )
            .await;
            let error = match result {
                Ok(record) => {
                    let entry = MappingEntry {
                        remote_id: record.remote_id,
                        base_hash: record.remote_hash,
                        last_synced_at: Utc::now(),
                    };
                    return self.commit(claim, entry, attempt);
                }
                Err(error) => error,
            };

            match self.policy.decide(&error, attempt, Utc::now()) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        pair = %change.pair,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying change"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Outcome::Skipped { reason: SkipReason::Cancelled };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Defer { resume_at } => return Outcome::Deferred { resume_at },
                RetryDecision::GiveUp => {
                    tracing::warn!(pair = %change.pair, attempt, error = %error, "change failed");
                    return Outcome::Failed {
                        attempts: attempt,
                        error: error.into(),
                    };
                }
            }
        }
    }

    /// One try at the remote write. A create that already failed once first
    /// checks whether the failed try got as far as creating the record, and
    /// updates that record instead of creating a second one.
    async fn attempt(
        &self,
        adapter: &dyn TrackerAdapter,
        change: &Change,
        draft: &Draft,
        target: &mut Option<String>,
        attempt: u32,
    ) -> Result<RemoteRecord, TrackerError> {
        if target.is_none() && attempt > 1 {
            if let Some(found) = created_earlier(adapter, change).await? {
                tracing::info!(pair = %change.pair, remote_id = %found, "earlier attempt created the record; updating it");
                *target = Some(found);
            }
        }
        call_once(adapter, draft, target.as_deref()).await
    }

    fn commit(&self, claim: &PairClaim, entry: MappingEntry, attempts: u32) -> Outcome {
        let remote_id = entry.remote_id.clone();
        match self.mapping.commit(claim, entry) {
            Ok(()) => Outcome::Applied {
                remote_id,
                attempts,
            },
            Err(err) => {
                tracing::error!(pair = %claim.key(), error = %err, "failed to commit mapping entry");
                Outcome::Failed {
                    attempts,
                    error: err.into(),
                }
            }
        }
    }
}

fn needs_remote(kind: &ChangeKind) -> bool {
    matches!(kind, ChangeKind::Create | ChangeKind::Update { .. })
}

async fn created_earlier(
    adapter: &dyn TrackerAdapter,
    change: &Change,
) -> Result<Option<String>, TrackerError> {
    let entity = &change.pair.entity;
    let lookup = Lookup {
        kind: entity.kind,
        plan_id: entity.id.clone(),
        title: change.fields.title.clone(),
        key: None,
    };
    match adapter.find_by_title_or_key(&lookup).await {
        Ok(record) if record.plan_id.as_deref().is_some_and(|id| id != entity.id) => Ok(None),
        Ok(record) => Ok(Some(record.remote_id)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Update `target` if set, otherwise create.
async fn call_once(
    adapter: &dyn TrackerAdapter,
    draft: &Draft,
    target: Option<&str>,
) -> Result<RemoteRecord, TrackerError> {
    match (draft, target) {
        (Draft::Issue(draft), Some(remote_id)) => adapter.update_issue(remote_id, draft).await,
        (Draft::Issue(draft), None) => adapter.create_issue(draft).await,
        (Draft::Artifact(kind, artifact), Some(remote_id)) => {
            adapter
                .update_project_artifact(*kind, remote_id, artifact)
                .await
        }
        (Draft::Artifact(kind, artifact), None) => {
            adapter.create_project_artifact(*kind, artifact).await
        }
    }
}
