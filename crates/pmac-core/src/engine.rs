//! Sync engine: one pass is load → reconcile → resolve → execute, plus the
//! plan save when inbound values were merged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hash::FieldSet;
use crate::mapping::{MappingEntry, MappingError, MappingTable, PairKey};
use crate::plan::{EntityKey, PlanError, PlanStore};
use crate::reconcile::{
    Change, ChangeKind, Conflict, EntityFailure, InboundPolicy, ReconcileOptions, Reconciler,
    RelinkDirection,
};
use crate::executor::{ChangeReport, Executor, Outcome};
use crate::resolve::{Strategy, resolve_all};
use crate::retry::RetryPolicy;
use crate::tracker::{TrackerKind, TrackerRegistry};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("{0} is not linked")]
    NotLinked(PairKey),
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub strategy: Strategy,
    pub inbound_policy: InboundPolicy,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    /// Compute the change set without touching remotes, mapping, or plan.
    pub dry_run: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            inbound_policy: InboundPolicy::default(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

/// Everything that happened in one pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub dry_run: bool,
    /// Changes computed in a dry run; empty otherwise.
    pub planned: Vec<Change>,
    /// Executed changes with their outcomes.
    pub reports: Vec<ChangeReport>,
    /// Conflicts the strategy left open.
    pub conflicts: Vec<Conflict>,
    /// Pairs excluded because their remote lookup failed.
    pub failures: Vec<EntityFailure>,
    /// Entities whose plan values were updated from a tracker.
    pub merged: Vec<EntityKey>,
}

impl PassReport {
    fn count(&self, label: &str) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.label() == label)
            .count()
    }

    pub fn applied(&self) -> usize {
        self.count("applied")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    pub fn deferred(&self) -> usize {
        self.count("deferred")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    /// No failures, deferrals, skips, open conflicts, or excluded pairs.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
            && self.failures.is_empty()
            && self.reports.iter().all(|r| r.outcome.is_applied())
    }
}

/// Sync state of one pair, computed without remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unlinked,
    InSync,
    /// The plan changed since the last sync.
    LocalChanges,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairStatus {
    pub pair: PairKey,
    pub state: PairState,
    pub remote_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub pairs: Vec<PairStatus>,
    /// Mapping entries whose plan entity no longer exists.
    pub orphaned: Vec<(PairKey, MappingEntry)>,
}

pub struct SyncEngine {
    store: PlanStore,
    mapping: Arc<MappingTable>,
    trackers: Arc<TrackerRegistry>,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(
        store: PlanStore,
        mapping: Arc<MappingTable>,
        trackers: Arc<TrackerRegistry>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            mapping,
            trackers,
            options,
        }
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    pub fn mapping(&self) -> &MappingTable {
        &self.mapping
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run one pass.
    ///
    /// Only plan loading (including validation) and the final plan save can
    /// fail the pass; tracker errors end up in the report.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport, EngineError> {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(
            pass_id = %pass_id,
            strategy = %self.options.strategy,
            dry_run = self.options.dry_run,
            trackers = ?self.trackers.kinds(),
            "starting sync pass"
        );

        let mut plan = self.store.load()?;
        let entities = plan.entities();

        let reconciler = Reconciler::new(
            &self.trackers,
            &self.mapping,
            ReconcileOptions {
                inbound_policy: self.options.inbound_policy,
                call_timeout: self.options.call_timeout,
            },
        );
        let output = reconciler.reconcile(&entities).await;
        let resolution = resolve_all(self.options.strategy, output.conflicts);

        let mut changes = output.changes;
        changes.extend(resolution.changes);
        changes.sort_by(|a, b| a.pair.cmp(&b.pair));

        let mut report = PassReport {
            pass_id,
            started_at,
            finished_at: started_at,
            strategy: self.options.strategy,
            dry_run: self.options.dry_run,
            planned: Vec::new(),
            reports: Vec::new(),
            conflicts: resolution.unresolved,
            failures: output.failures,
            merged: Vec::new(),
        };

        if self.options.dry_run {
            report.planned = changes;
            report.finished_at = Utc::now();
            tracing::info!(pass_id = %pass_id, planned = report.planned.len(), "dry run complete");
            return Ok(report);
        }

        let executor = Executor::new(
            &self.trackers,
            &self.mapping,
            self.options.retry,
            self.options.call_timeout,
        );
        report.reports = executor.execute(changes, cancel).await;

        let now = Utc::now();
        for r in &report.reports {
            let pulled = matches!(
                r.change.kind,
                ChangeKind::Relink {
                    direction: RelinkDirection::Pull,
                    ..
                }
            );
            if pulled
                && r.outcome.is_applied()
                && plan.apply_inbound(&r.change.pair.entity, &r.change.fields, now)
            {
                report.merged.push(r.change.pair.entity.clone());
            }
        }
        if !report.merged.is_empty() {
            self.store.save(&plan)?;
        }

        report.finished_at = Utc::now();
        tracing::info!(
            pass_id = %pass_id,
            applied = report.applied(),
            failed = report.failed(),
            deferred = report.deferred(),
            skipped = report.skipped(),
            conflicts = report.conflicts.len(),
            merged = report.merged.len(),
            "sync pass complete"
        );
        Ok(report)
    }

    /// Remove the mapping entry for one pair. The remote record is untouched.
    pub async fn unlink(
        &self,
        entity: EntityKey,
        tracker: TrackerKind,
    ) -> Result<ChangeReport, EngineError> {
        let pair = PairKey::new(entity, tracker);
        let Some(entry) = self.mapping.get(&pair) else {
            return Err(EngineError::NotLinked(pair));
        };
        let change = Change {
            pair,
            kind: ChangeKind::Unlink {
                remote_id: entry.remote_id,
            },
            fields: FieldSet::default(),
            changed: Vec::new(),
            parent: None,
            members: Vec::new(),
            expected_base: Some(entry.base_hash),
        };
        let executor = Executor::new(
            &self.trackers,
            &self.mapping,
            self.options.retry,
            self.options.call_timeout,
        );
        let mut reports = executor
            .execute(vec![change], &CancellationToken::new())
            .await;
        let report = reports.remove(0);
        if let Outcome::Failed { error, .. } = &report.outcome {
            tracing::warn!(pair = %report.change.pair, error = %error, "unlink failed");
        }
        Ok(report)
    }

    /// Compare the plan against the mapping table without remote calls.
    pub fn status(&self) -> Result<StatusReport, EngineError> {
        let plan = self.store.load()?;
        let entities = plan.entities();
        let mapping = self.mapping.snapshot();
        let kinds = if self.trackers.is_empty() {
            TrackerKind::ALL.to_vec()
        } else {
            self.trackers.kinds()
        };

        let mut report = StatusReport::default();
        for entity in &entities {
            for &tracker in &kinds {
                let pair = PairKey::new(entity.key.clone(), tracker);
                let content = match self.trackers.get(tracker) {
                    Some(adapter) => adapter.representable_fields(entity.key.kind, &entity.fields),
                    None => entity.fields.clone(),
                };
                let status = match mapping.get(&pair) {
                    None => PairStatus {
                        pair,
                        state: PairState::Unlinked,
                        remote_id: None,
                        last_synced_at: None,
                    },
                    Some(entry) => PairStatus {
                        pair,
                        state: if content.digest() == entry.base_hash {
                            PairState::InSync
                        } else {
                            PairState::LocalChanges
                        },
                        remote_id: Some(entry.remote_id.clone()),
                        last_synced_at: Some(entry.last_synced_at),
                    },
                };
                report.pairs.push(status);
            }
        }

        report.orphaned = mapping
            .into_iter()
            .filter(|(pair, _)| !entities.iter().any(|e| e.key == pair.entity))
            .collect();
        report.pairs.sort_by(|a, b| a.pair.cmp(&b.pair));
        Ok(report)
    }
}
