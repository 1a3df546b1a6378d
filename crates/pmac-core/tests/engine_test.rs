//! End-to-end passes over a plan file, a mapping file and two fake trackers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pmac_core::engine::{EngineError, EngineOptions, PairState, SyncEngine};
use pmac_core::executor::Outcome;
use pmac_core::hash::FieldSet;
use pmac_core::mapping::{MappingEntry, MappingTable, PairKey};
use pmac_core::plan::{EntityKey, EntityKind, PlanError, PlanStore};
use pmac_core::resolve::Strategy;
use pmac_core::tracker::{TrackerKind, TrackerRegistry};
use pmac_test_utils::{FULL_PLAN, FakeTracker, MINIMAL_PLAN, write_plan};

// ===========================================================================
// Test harness
// ===========================================================================

struct Harness {
    _dir: TempDir,
    plan_path: PathBuf,
    mapping_path: PathBuf,
    github: Arc<FakeTracker>,
    jira: Arc<FakeTracker>,
}

impl Harness {
    fn new(plan_json: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let plan_path = write_plan(dir.path(), plan_json);
        let mapping_path = dir.path().join(".pmac").join("mapping.json");
        Self {
            _dir: dir,
            plan_path,
            mapping_path,
            github: FakeTracker::shared(TrackerKind::GitHub),
            jira: FakeTracker::shared(TrackerKind::Jira),
        }
    }

    /// A fresh engine, as a new process would build it.
    fn engine(&self, options: EngineOptions) -> Result<SyncEngine> {
        let mut registry = TrackerRegistry::new();
        registry.register(self.github.clone());
        registry.register(self.jira.clone());
        Ok(SyncEngine::new(
            PlanStore::new(&self.plan_path),
            Arc::new(MappingTable::open(&self.mapping_path)?),
            Arc::new(registry),
            options,
        ))
    }

    async fn pass(&self, options: EngineOptions) -> Result<pmac_core::engine::PassReport> {
        Ok(self
            .engine(options)?
            .run_pass(&CancellationToken::new())
            .await?)
    }

    fn store(&self) -> PlanStore {
        PlanStore::new(&self.plan_path)
    }

    fn remote_id(&self, key: EntityKey, tracker: TrackerKind) -> Result<String> {
        let mapping = MappingTable::open(&self.mapping_path)?;
        Ok(mapping
            .get(&PairKey::new(key, tracker))
            .map(|e| e.remote_id)
            .expect("pair is mapped"))
    }

    fn mutations(&self) -> (u32, u32) {
        (self.github.mutation_count(), self.jira.mutation_count())
    }
}

fn strategy(strategy: Strategy) -> EngineOptions {
    EngineOptions {
        strategy,
        ..EngineOptions::default()
    }
}

// ===========================================================================
// Passes
// ===========================================================================

#[tokio::test]
async fn first_pass_creates_everything_and_second_pass_is_empty() -> Result<()> {
    let h = Harness::new(FULL_PLAN);

    let first = h.pass(EngineOptions::default()).await?;
    assert_eq!(first.reports.len(), 14);
    assert_eq!(first.applied(), 14);
    assert!(first.is_clean());
    assert!(first.merged.is_empty());
    assert_eq!(h.mutations(), (7, 7));

    let second = h.pass(EngineOptions::default()).await?;
    assert!(second.reports.is_empty(), "got {:?}", second.reports);
    assert!(second.is_clean());
    assert_eq!(h.mutations(), (7, 7));
    assert_ne!(first.pass_id, second.pass_id);
    Ok(())
}

#[tokio::test]
async fn board_is_created_holding_its_assigned_stories() -> Result<()> {
    let h = Harness::new(FULL_PLAN);
    h.pass(EngineOptions::default()).await?;

    let board = h.remote_id(EntityKey::new(EntityKind::View, "Team board"), TrackerKind::GitHub)?;
    let expected = ["S1", "S3", "S2"]
        .into_iter()
        .map(|id| h.remote_id(EntityKey::story(id), TrackerKind::GitHub))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(h.github.items_of(&board), expected);
    Ok(())
}

#[tokio::test]
async fn stories_are_parented_on_both_trackers() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    h.pass(EngineOptions::default()).await?;

    for (tracker, fake) in [(TrackerKind::GitHub, &h.github), (TrackerKind::Jira, &h.jira)] {
        let epic = h.remote_id(EntityKey::epic("E1"), tracker)?;
        let story = h.remote_id(EntityKey::story("S1"), tracker)?;
        assert_eq!(fake.parent_of(&story), Some(epic));
    }
    Ok(())
}

#[tokio::test]
async fn plan_edit_is_pushed_to_both_trackers() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    h.pass(EngineOptions::default()).await?;

    let store = h.store();
    let mut plan = store.load()?;
    plan.stories[0].story_points = 5;
    store.save(&plan)?;

    let report = h.pass(EngineOptions::default()).await?;
    let labels: Vec<String> = report
        .reports
        .iter()
        .map(|r| format!("{} {}", r.change.pair, r.change.kind.label()))
        .collect();
    assert_eq!(labels, vec!["story:S1@github update", "story:S1@jira update"]);

    let story = h.remote_id(EntityKey::story("S1"), TrackerKind::Jira)?;
    assert_eq!(h.jira.record(&story).expect("record").fields.points, Some(5));
    Ok(())
}

#[tokio::test]
async fn inbound_edit_is_merged_into_the_plan_then_propagated() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    h.pass(EngineOptions::default()).await?;
    let github_s1 = h.remote_id(EntityKey::story("S1"), TrackerKind::GitHub)?;
    h.github
        .edit_remote(&github_s1, |f| f.status = Some("Done".to_string()));

    let pulled = h.pass(EngineOptions::default()).await?;
    assert_eq!(pulled.reports.len(), 1);
    assert_eq!(pulled.reports[0].change.kind.label(), "pull");
    assert_eq!(pulled.merged, vec![EntityKey::story("S1")]);
    let plan = h.store().load()?;
    assert_eq!(plan.stories[0].status, "Done");
    assert!(plan.stories[0].updated_at.is_some());

    let pushed = h.pass(EngineOptions::default()).await?;
    assert_eq!(pushed.reports.len(), 1);
    assert_eq!(pushed.reports[0].change.pair.tracker, TrackerKind::Jira);
    assert_eq!(pushed.reports[0].change.kind.label(), "update");
    let jira_s1 = h.remote_id(EntityKey::story("S1"), TrackerKind::Jira)?;
    assert_eq!(
        h.jira.record(&jira_s1).expect("record").fields.status.as_deref(),
        Some("Done")
    );

    let settled = h.pass(EngineOptions::default()).await?;
    assert!(settled.reports.is_empty());
    Ok(())
}

#[tokio::test]
async fn dry_run_touches_nothing() -> Result<()> {
    let h = Harness::new(FULL_PLAN);
    let before = std::fs::read_to_string(&h.plan_path)?;

    let report = h
        .pass(EngineOptions {
            dry_run: true,
            ..EngineOptions::default()
        })
        .await?;

    assert!(report.dry_run);
    assert_eq!(report.planned.len(), 14);
    assert!(report.reports.is_empty());
    assert_eq!(h.mutations(), (0, 0));
    assert!(!h.mapping_path.exists());
    assert_eq!(std::fs::read_to_string(&h.plan_path)?, before);
    Ok(())
}

#[tokio::test]
async fn invalid_plan_fails_before_any_remote_call() -> Result<()> {
    let h = Harness::new(&MINIMAL_PLAN.replace("\"story_points\": 2", "\"story_points\": -1"));

    let err = h
        .engine(EngineOptions::default())?
        .run_pass(&CancellationToken::new())
        .await
        .expect_err("negative points are invalid");

    assert!(
        matches!(err, EngineError::Plan(PlanError::Invalid { .. })),
        "got {err:?}"
    );
    assert!(h.github.calls().is_empty());
    assert!(h.jira.calls().is_empty());
    Ok(())
}

// ===========================================================================
// Conflicts
// ===========================================================================

/// Sync, then change S1's status in the plan and on GitHub.
async fn diverge(h: &Harness) -> Result<String> {
    h.pass(EngineOptions::default()).await?;
    let remote = h.remote_id(EntityKey::story("S1"), TrackerKind::GitHub)?;
    h.github.edit_remote_at(&remote, Utc::now() + TimeDelta::days(1), |f| {
        f.status = Some("Done".to_string())
    });
    let store = h.store();
    let mut plan = store.load()?;
    plan.stories[0].status = "Review".to_string();
    store.save(&plan)?;
    Ok(remote)
}

#[tokio::test]
async fn manual_strategy_reports_the_conflict_and_changes_nothing() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    let remote = diverge(&h).await?;

    let report = h.pass(strategy(Strategy::Manual)).await?;

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].pair.tracker, TrackerKind::GitHub);
    assert!(!report.is_clean());
    assert_eq!(
        h.github.record(&remote).expect("record").fields.status.as_deref(),
        Some("Done")
    );
    // Jira saw only the plan edit.
    let trackers: Vec<TrackerKind> = report.reports.iter().map(|r| r.change.pair.tracker).collect();
    assert_eq!(trackers, vec![TrackerKind::Jira]);
    Ok(())
}

#[tokio::test]
async fn source_priority_overwrites_the_remote() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    let remote = diverge(&h).await?;

    let report = h.pass(strategy(Strategy::SourcePriority)).await?;

    assert!(report.conflicts.is_empty());
    assert_eq!(
        h.github.record(&remote).expect("record").fields.status.as_deref(),
        Some("Review")
    );
    Ok(())
}

#[tokio::test]
async fn newest_wins_pulls_the_newer_remote_value() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    diverge(&h).await?;

    let report = h.pass(strategy(Strategy::NewestWins)).await?;

    assert_eq!(report.merged, vec![EntityKey::story("S1")]);
    assert_eq!(h.store().load()?.stories[0].status, "Done");
    Ok(())
}

// ===========================================================================
// Unlink and status
// ===========================================================================

#[tokio::test]
async fn unlink_removes_the_entry_and_the_next_pass_re_adopts() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    h.pass(EngineOptions::default()).await?;
    let remote = h.remote_id(EntityKey::story("S1"), TrackerKind::GitHub)?;
    let engine = h.engine(EngineOptions::default())?;

    let report = engine
        .unlink(EntityKey::story("S1"), TrackerKind::GitHub)
        .await?;
    assert_eq!(
        report.outcome,
        Outcome::Applied {
            remote_id: remote.clone(),
            attempts: 0
        }
    );
    let again = engine
        .unlink(EntityKey::story("S1"), TrackerKind::GitHub)
        .await
        .expect_err("already unlinked");
    assert!(matches!(again, EngineError::NotLinked(_)));

    let next = h.pass(EngineOptions::default()).await?;
    assert_eq!(next.reports.len(), 1);
    assert_eq!(next.reports[0].change.kind.label(), "adopt");
    assert_eq!(h.remote_id(EntityKey::story("S1"), TrackerKind::GitHub)?, remote);
    assert_eq!(h.github.mutation_count(), 2, "no duplicate was created");
    Ok(())
}

#[tokio::test]
async fn status_reports_local_drift_and_orphans() -> Result<()> {
    let h = Harness::new(MINIMAL_PLAN);
    let engine = h.engine(EngineOptions::default())?;
    let before = engine.status()?;
    assert!(before.pairs.iter().all(|p| p.state == PairState::Unlinked));
    assert_eq!(before.pairs.len(), 4);

    h.pass(EngineOptions::default()).await?;
    let store = h.store();
    let mut plan = store.load()?;
    plan.epics[0].description = "Rewritten".to_string();
    store.save(&plan)?;

    let mapping = MappingTable::open(&h.mapping_path)?;
    let orphan = PairKey::new(EntityKey::story("S9"), TrackerKind::Jira);
    let claim = mapping.claim(orphan.clone())?;
    mapping.commit(
        &claim,
        MappingEntry {
            remote_id: "PM-99".to_string(),
            base_hash: FieldSet::new("gone").digest(),
            last_synced_at: Utc::now(),
        },
    )?;
    drop(claim);

    let status = h.engine(EngineOptions::default())?.status()?;
    let states: Vec<(String, PairState)> = status
        .pairs
        .iter()
        .map(|p| (p.pair.to_string(), p.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("epic:E1@github".to_string(), PairState::LocalChanges),
            ("epic:E1@jira".to_string(), PairState::LocalChanges),
            ("story:S1@github".to_string(), PairState::InSync),
            ("story:S1@jira".to_string(), PairState::InSync),
        ]
    );
    assert_eq!(status.orphaned.len(), 1);
    assert_eq!(status.orphaned[0].0, orphan);
    Ok(())
}
