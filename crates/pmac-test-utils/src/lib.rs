//! Shared test utilities for pmac integration tests.
//!
//! - [`FakeTracker`]: an in-memory [`TrackerAdapter`] with scriptable
//!   failures and direct access to its remote records.
//! - [`ScriptedTransport`]: a [`Transport`] answering from canned JSON, for
//!   exercising the real GitHub and Jira adapters.
//! - Plan fixtures and helpers for writing them to disk.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use pmac_core::hash::FieldSet;
use pmac_core::plan::{EntityKey, EntityKind};
use pmac_core::tracker::{
    ArtifactDraft, IssueDraft, IssueFilter, Lookup, Method, RemoteRecord, Request, TrackerAdapter,
    TrackerError, TrackerKind, Transport, TransportError,
};

// -----------------------------------------------------------------------
// Fake tracker
// -----------------------------------------------------------------------

/// Fixed starting time for fake clocks, so tests are reproducible.
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000, 0).unwrap_or_default()
}

#[derive(Default)]
struct FakeState {
    records: BTreeMap<String, RemoteRecord>,
    /// remote id → remote id of the epic it was linked to.
    parents: BTreeMap<String, String>,
    /// view remote id → issue remote ids placed on it.
    items: BTreeMap<String, Vec<String>>,
    next_id: u64,
    clock: DateTime<Utc>,
    mutations: u32,
    /// 1-based mutation number → error returned instead of applying it.
    scripted: BTreeMap<u32, TrackerError>,
    fail_every_mutation: Option<TrackerError>,
    lookup_failures: BTreeMap<String, TrackerError>,
    listing_failure: Option<TrackerError>,
    calls: Vec<String>,
}

/// In-memory tracker.
///
/// Every mutation (issue or artifact create/update) counts toward
/// [`FakeTracker::mutation_count`], including ones that were scripted to
/// fail.
pub struct FakeTracker {
    kind: TrackerKind,
    state: Mutex<FakeState>,
}

impl FakeTracker {
    pub fn new(kind: TrackerKind) -> Self {
        Self {
            kind,
            state: Mutex::new(FakeState {
                clock: epoch(),
                ..FakeState::default()
            }),
        }
    }

    pub fn shared(kind: TrackerKind) -> Arc<Self> {
        Arc::new(Self::new(kind))
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the `n`th mutation (1-based, counted across all kinds) fail.
    pub fn fail_mutation(&self, n: u32, error: TrackerError) {
        self.state().scripted.insert(n, error);
    }

    /// Make every mutation fail from now on.
    pub fn fail_all_mutations(&self, error: TrackerError) {
        self.state().fail_every_mutation = Some(error);
    }

    /// Make lookups for `plan_id` fail.
    pub fn fail_lookup(&self, plan_id: &str, error: TrackerError) {
        self.state()
            .lookup_failures
            .insert(plan_id.to_string(), error);
    }

    /// Make issue listing fail.
    pub fn fail_listing(&self, error: TrackerError) {
        self.state().listing_failure = Some(error);
    }

    /// Move the fake clock forward.
    pub fn advance(&self, by: TimeDelta) {
        let mut state = self.state();
        state.clock += by;
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().clock
    }

    /// Seed a remote record that predates any sync, as if a human created it.
    pub fn insert_remote(&self, kind: EntityKind, plan_id: Option<&str>, fields: FieldSet) -> String {
        let mut state = self.state();
        let remote_id = next_remote_id(&mut state, self.kind, kind);
        let record = RemoteRecord::new(
            self.kind,
            remote_id.clone(),
            Some(kind),
            plan_id.map(str::to_string),
            fields,
            Some(state.clock),
        );
        state.records.insert(remote_id.clone(), record);
        remote_id
    }

    /// Edit a record on the remote side at the current fake time.
    pub fn edit_remote(&self, remote_id: &str, edit: impl FnOnce(&mut FieldSet)) {
        let at = self.now();
        self.edit_remote_at(remote_id, at, edit);
    }

    /// Edit a record on the remote side with an explicit modification time.
    pub fn edit_remote_at(
        &self,
        remote_id: &str,
        at: DateTime<Utc>,
        edit: impl FnOnce(&mut FieldSet),
    ) {
        let mut state = self.state();
        let Some(record) = state.records.get(remote_id) else {
            panic!("no remote record {remote_id} on {}", self.kind);
        };
        let mut fields = record.fields.clone();
        edit(&mut fields);
        let updated = RemoteRecord::new(
            self.kind,
            remote_id,
            record.kind,
            record.plan_id.clone(),
            fields,
            Some(at),
        );
        state.records.insert(remote_id.to_string(), updated);
    }

    pub fn record(&self, remote_id: &str) -> Option<RemoteRecord> {
        self.state().records.get(remote_id).cloned()
    }

    /// The record carrying `key`'s plan id.
    pub fn record_for(&self, key: &EntityKey) -> Option<RemoteRecord> {
        self.state()
            .records
            .values()
            .find(|r| r.kind == Some(key.kind) && r.plan_id.as_deref() == Some(key.id.as_str()))
            .cloned()
    }

    pub fn records(&self) -> Vec<RemoteRecord> {
        self.state().records.values().cloned().collect()
    }

    /// Remote id of the epic a story was linked to on its last write.
    pub fn parent_of(&self, remote_id: &str) -> Option<String> {
        self.state().parents.get(remote_id).cloned()
    }

    /// Issues placed on a view by its last write.
    pub fn items_of(&self, remote_id: &str) -> Vec<String> {
        self.state().items.get(remote_id).cloned().unwrap_or_default()
    }

    fn place_items(&self, record: &RemoteRecord, artifact: &ArtifactDraft) {
        if !artifact.items.is_empty() {
            self.state()
                .items
                .insert(record.remote_id.clone(), artifact.items.clone());
        }
    }

    pub fn mutation_count(&self) -> u32 {
        self.state().mutations
    }

    /// Every call made, e.g. `"create_issue story:S1"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn mutate(
        &self,
        call: String,
        kind: EntityKind,
        plan_id: &str,
        existing: Option<&str>,
        fields: &FieldSet,
        parent: Option<String>,
    ) -> Result<RemoteRecord, TrackerError> {
        let mut state = self.state();
        state.calls.push(call);
        state.mutations += 1;
        let n = state.mutations;
        if let Some(err) = state.scripted.remove(&n) {
            return Err(err);
        }
        if let Some(err) = &state.fail_every_mutation {
            return Err(err.clone());
        }

        let remote_id = match existing {
            Some(id) if state.records.contains_key(id) => id.to_string(),
            Some(id) => return Err(TrackerError::not_found(self.kind, id)),
            None => next_remote_id(&mut state, self.kind, kind),
        };
        let record = RemoteRecord::new(
            self.kind,
            remote_id.clone(),
            Some(kind),
            Some(plan_id.to_string()),
            fields.clone(),
            Some(state.clock),
        );
        state.records.insert(remote_id.clone(), record.clone());
        match parent {
            Some(parent) => state.parents.insert(remote_id, parent),
            None => state.parents.remove(&remote_id),
        };
        Ok(record)
    }
}

fn next_remote_id(state: &mut FakeState, tracker: TrackerKind, kind: EntityKind) -> String {
    state.next_id += 1;
    let n = state.next_id;
    match (tracker, kind.is_issue()) {
        (TrackerKind::GitHub, true) => n.to_string(),
        (TrackerKind::Jira, true) => format!("PM-{n}"),
        (_, false) => format!("{}-{n}", kind.as_str()),
    }
}

#[async_trait]
impl TrackerAdapter for FakeTracker {
    fn kind(&self) -> TrackerKind {
        self.kind
    }

    fn list_issues<'a>(
        &'a self,
        _filter: &'a IssueFilter,
    ) -> BoxStream<'a, Result<RemoteRecord, TrackerError>> {
        let mut state = self.state();
        state.calls.push("list_issues".to_string());
        let items: Vec<Result<RemoteRecord, TrackerError>> = match &state.listing_failure {
            Some(err) => vec![Err(err.clone())],
            None => state
                .records
                .values()
                .filter(|r| r.kind.is_some_and(EntityKind::is_issue))
                .cloned()
                .map(Ok)
                .collect(),
        };
        futures::stream::iter(items).boxed()
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteRecord, TrackerError> {
        let key = EntityKey::new(draft.kind, &draft.plan_id);
        self.mutate(
            format!("create_issue {key}"),
            draft.kind,
            &draft.plan_id,
            None,
            &draft.fields,
            draft.parent.as_ref().map(|p| p.remote_id.clone()),
        )
    }

    async fn update_issue(
        &self,
        remote_id: &str,
        draft: &IssueDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        let key = EntityKey::new(draft.kind, &draft.plan_id);
        self.mutate(
            format!("update_issue {key}"),
            draft.kind,
            &draft.plan_id,
            Some(remote_id),
            &draft.fields,
            draft.parent.as_ref().map(|p| p.remote_id.clone()),
        )
    }

    async fn find_by_title_or_key(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        let mut state = self.state();
        let key = EntityKey::new(lookup.kind, &lookup.plan_id);
        state.calls.push(format!("find {key}"));
        if let Some(err) = state.lookup_failures.get(&lookup.plan_id) {
            return Err(err.clone());
        }
        let same_kind = |r: &&RemoteRecord| r.kind == Some(lookup.kind);
        let by_key = lookup
            .key
            .as_ref()
            .and_then(|k| state.records.get(k))
            .filter(|r| same_kind(r));
        let by_id = || {
            state
                .records
                .values()
                .filter(same_kind)
                .find(|r| r.plan_id.as_deref() == Some(lookup.plan_id.as_str()))
        };
        let by_title = || {
            state
                .records
                .values()
                .filter(same_kind)
                .find(|r| r.fields.title == lookup.title)
        };
        by_key
            .or_else(by_id)
            .or_else(by_title)
            .cloned()
            .ok_or_else(|| TrackerError::not_found(self.kind, key.to_string()))
    }

    async fn create_project_artifact(
        &self,
        kind: EntityKind,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        let key = EntityKey::new(kind, &artifact.plan_id);
        let record = self.mutate(
            format!("create_artifact {key}"),
            kind,
            &artifact.plan_id,
            None,
            &artifact.fields,
            None,
        )?;
        self.place_items(&record, artifact);
        Ok(record)
    }

    async fn update_project_artifact(
        &self,
        kind: EntityKind,
        remote_id: &str,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        let key = EntityKey::new(kind, &artifact.plan_id);
        let record = self.mutate(
            format!("update_artifact {key}"),
            kind,
            &artifact.plan_id,
            Some(remote_id),
            &artifact.fields,
            None,
        )?;
        self.place_items(&record, artifact);
        Ok(record)
    }
}

// -----------------------------------------------------------------------
// Scripted transport
// -----------------------------------------------------------------------

struct Scripted {
    method: Method,
    path: String,
    response: Result<Value, TransportError>,
}

/// Transport answering from a queue of canned responses.
///
/// A request takes the first queued response with the same method and path.
/// Requests with no scripted response get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, method: Method, path: &str, body: Value) -> &Self {
        self.push(method, path, Ok(body))
    }

    pub fn on_error(&self, method: Method, path: &str, error: TransportError) -> &Self {
        self.push(method, path, Err(error))
    }

    fn push(&self, method: Method, path: &str, response: Result<Value, TransportError>) -> &Self {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Scripted {
                method,
                path: path.to_string(),
                response,
            });
        self
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Requests with the given method and path.
    pub fn requests_to(&self, method: Method, path: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    /// Scripted responses nobody asked for.
    pub fn unused(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Value, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        let position = queue
            .iter()
            .position(|s| s.method == request.method && s.path == request.path);
        match position.and_then(|i| queue.remove(i)) {
            Some(scripted) => scripted.response,
            None => Err(TransportError::status(
                404,
                format!("no scripted response for {:?} {}", request.method, request.path),
            )),
        }
    }
}

// -----------------------------------------------------------------------
// Plan fixtures
// -----------------------------------------------------------------------

/// One epic with one story.
pub const MINIMAL_PLAN: &str = r#"{
  "project": {
    "project_key": "PM",
    "name": "Payments",
    "description": "Checkout rework"
  },
  "epics": [
    {
      "id": "E1",
      "title": "Checkout",
      "description": "New checkout flow",
      "stories": ["S1"]
    }
  ],
  "stories": [
    {
      "id": "S1",
      "epic_id": "E1",
      "summary": "Card form",
      "description": "Collect card details",
      "story_points": 2,
      "labels": ["frontend"],
      "status": "To Do"
    }
  ],
  "sprints": [],
  "views": []
}
"#;

/// Two epics, three stories, a sprint, and a view.
pub const FULL_PLAN: &str = r#"{
  "project": {
    "project_key": "PM",
    "name": "Payments",
    "description": "Checkout rework"
  },
  "epics": [
    {
      "id": "E1",
      "title": "Checkout",
      "description": "New checkout flow",
      "stories": ["S1", "S2"]
    },
    {
      "id": "E2",
      "title": "Refunds",
      "description": "",
      "stories": ["S3"]
    }
  ],
  "stories": [
    {
      "id": "S1",
      "epic_id": "E1",
      "summary": "Card form",
      "description": "Collect card details",
      "story_points": 2,
      "labels": ["frontend"],
      "status": "To Do"
    },
    {
      "id": "S2",
      "epic_id": "E1",
      "summary": "Payment API",
      "description": "",
      "story_points": 5,
      "labels": ["backend"],
      "status": "In Progress"
    },
    {
      "id": "S3",
      "epic_id": "E2",
      "summary": "Refund button",
      "description": "",
      "story_points": 1,
      "labels": [],
      "status": "To Do"
    }
  ],
  "sprints": [
    {
      "name": "Sprint 1",
      "start_date": "2025-06-02",
      "end_date": "2025-06-13",
      "stories": ["S1", "S2"]
    }
  ],
  "views": [
    {
      "name": "Team board",
      "type": "kanban",
      "columns": ["To Do", "In Progress", "Review", "Done"],
      "initial_assignments": {
        "To Do": ["S1", "S3"],
        "In Progress": ["S2"]
      }
    }
  ]
}
"#;

/// Write `json` as `project_plan.json` under `dir` and return its path.
pub fn write_plan(dir: &Path, json: &str) -> PathBuf {
    let path = dir.join("project_plan.json");
    std::fs::write(&path, json).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
    path
}

/// The story fields `MINIMAL_PLAN` declares for `S1`.
pub fn s1_fields() -> FieldSet {
    FieldSet {
        title: "Card form".to_string(),
        description: "Collect card details".to_string(),
        labels: vec!["frontend".to_string()],
        status: Some("To Do".to_string()),
        points: Some(2),
        extra: BTreeMap::new(),
    }
}
