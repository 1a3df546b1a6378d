//! GitHub adapter.
//!
//! Epics and stories are repository issues. Plan metadata rides on labels:
//!
//! | label          | meaning                         |
//! |----------------|---------------------------------|
//! | `kind:<kind>`  | `epic` or `story`               |
//! | `id:<id>`      | plan id, used for dedup         |
//! | `status:<s>`   | story status                    |
//! | `points:<n>`   | story points                    |
//! | `epic:<id>`    | a story's epic                  |
//!
//! Sprints are milestones and views are Projects (v2). Neither has a slot
//! for dates, view type or columns, so those live in the milestone
//! description and the project's short description as `key: value` lines.
//! A view's assigned stories are added to its project as items.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{Value, json};

use super::error::TrackerError;
use super::trait_def::TrackerAdapter;
use super::transport::{self, Request, Transport};
use super::types::{ArtifactDraft, IssueDraft, IssueFilter, Lookup, RemoteRecord, TrackerKind};
use crate::hash::{FieldSet, decode_extras, encode_extras};
use crate::plan::EntityKind;

const KIND_PREFIX: &str = "kind:";
const ID_PREFIX: &str = "id:";
const STATUS_PREFIX: &str = "status:";
const POINTS_PREFIX: &str = "points:";
const EPIC_PREFIX: &str = "epic:";

const CONVENTION_PREFIXES: [&str; 5] = [
    KIND_PREFIX,
    ID_PREFIX,
    STATUS_PREFIX,
    POINTS_PREFIX,
    EPIC_PREFIX,
];

const PROJECT_FIELDS: &str = "id title shortDescription updatedAt";

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// `owner/name`.
    pub repo: String,
    /// Login owning the Projects that back views; defaults to the repo owner.
    pub project_owner: Option<String>,
    pub per_page: usize,
    /// Story status that maps to a closed issue.
    pub closed_status: String,
}

impl GitHubConfig {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            project_owner: None,
            per_page: 100,
            closed_status: "Done".to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        self.project_owner
            .as_deref()
            .unwrap_or_else(|| self.repo.split('/').next().unwrap_or(&self.repo))
    }
}

pub struct GitHubAdapter {
    config: GitHubConfig,
    transport: Arc<dyn Transport>,
}

impl GitHubAdapter {
    pub fn new(config: GitHubConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    async fn call(&self, request: Request) -> Result<Value, TrackerError> {
        transport::call(self.transport.as_ref(), TrackerKind::GitHub, request).await
    }

    fn issues_path(&self) -> String {
        format!("/repos/{}/issues", self.config.repo)
    }

    fn milestones_path(&self) -> String {
        format!("/repos/{}/milestones", self.config.repo)
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    fn issue_payload(&self, draft: &IssueDraft) -> Value {
        let state = match draft.fields.status.as_deref() {
            Some(s) if s == self.config.closed_status => "closed",
            _ => "open",
        };
        json!({
            "title": draft.fields.title,
            "body": draft.fields.description,
            "labels": issue_labels(draft),
            "state": state,
        })
    }

    fn issue_record(
        &self,
        item: &Value,
        hint: Option<EntityKind>,
    ) -> Result<RemoteRecord, TrackerError> {
        let number = item
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::GitHub, "issue without a number"))?;
        let labels: Vec<String> = item
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.get("name").and_then(Value::as_str).or_else(|| l.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let kind = label_value(&labels, KIND_PREFIX)
            .and_then(|k| k.parse::<EntityKind>().ok())
            .filter(|k| k.is_issue())
            .or(hint);
        let plan_id = label_value(&labels, ID_PREFIX).map(str::to_string);
        let closed = str_field(item, "state") == "closed";

        let mut fields = FieldSet {
            title: str_field(item, "title").to_string(),
            description: str_field(item, "body").to_string(),
            ..FieldSet::default()
        };
        if kind != Some(EntityKind::Epic) {
            fields.labels = labels
                .iter()
                .filter(|l| !is_convention_label(l))
                .cloned()
                .collect();
            fields.status = label_value(&labels, STATUS_PREFIX)
                .map(str::to_string)
                .or_else(|| closed.then(|| self.config.closed_status.clone()));
            fields.points = label_value(&labels, POINTS_PREFIX).and_then(|p| p.parse().ok());
        }

        Ok(RemoteRecord::new(
            TrackerKind::GitHub,
            number.to_string(),
            kind,
            plan_id,
            fields,
            timestamp(item, "updated_at"),
        ))
    }

    async fn search_issues(&self, query: String) -> Result<Vec<Value>, TrackerError> {
        let body = self
            .call(
                Request::get("/search/issues")
                    .query("q", query)
                    .query("per_page", self.config.per_page),
            )
            .await?;
        Ok(body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_issue(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        if let Some(number) = &lookup.key {
            match self
                .call(Request::get(format!("{}/{number}", self.issues_path())))
                .await
            {
                Ok(item) if item.get("pull_request").is_none() => {
                    return self.issue_record(&item, Some(lookup.kind));
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let by_label = self
            .search_issues(format!(
                "repo:{} is:issue label:\"{ID_PREFIX}{}\"",
                self.config.repo, lookup.plan_id
            ))
            .await?;
        for item in &by_label {
            let record = self.issue_record(item, Some(lookup.kind))?;
            if record.kind == Some(lookup.kind) && record.plan_id.as_deref() == Some(&lookup.plan_id)
            {
                return Ok(record);
            }
        }

        let by_title = self
            .search_issues(format!(
                "repo:{} is:issue in:title \"{}\"",
                self.config.repo,
                lookup.title.replace('"', "")
            ))
            .await?;
        for item in &by_title {
            if str_field(item, "title") != lookup.title {
                continue;
            }
            let record = self.issue_record(item, Some(lookup.kind))?;
            if record.kind == Some(lookup.kind) {
                return Ok(record);
            }
        }

        Err(TrackerError::not_found(
            TrackerKind::GitHub,
            format!("{} {:?}", lookup.kind, lookup.title),
        ))
    }

    // -----------------------------------------------------------------------
    // Milestones (sprints)
    // -----------------------------------------------------------------------

    fn milestone_payload(artifact: &ArtifactDraft) -> Value {
        let mut payload = json!({
            "title": artifact.fields.title,
            "description": encode_extras(&artifact.fields.extra),
        });
        if let Some(end) = artifact.fields.extra.get("end_date") {
            payload["due_on"] = json!(format!("{end}T00:00:00Z"));
        }
        payload
    }

    fn milestone_record(item: &Value) -> Result<RemoteRecord, TrackerError> {
        let number = item.get("number").and_then(Value::as_u64).ok_or_else(|| {
            TrackerError::permanent(TrackerKind::GitHub, "milestone without a number")
        })?;
        let fields = FieldSet {
            title: str_field(item, "title").to_string(),
            extra: decode_extras(str_field(item, "description")),
            ..FieldSet::default()
        };
        Ok(RemoteRecord::new(
            TrackerKind::GitHub,
            number.to_string(),
            Some(EntityKind::Sprint),
            None,
            fields,
            timestamp(item, "updated_at"),
        ))
    }

    async fn find_milestone(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        if let Some(number) = &lookup.key {
            match self
                .call(Request::get(format!("{}/{number}", self.milestones_path())))
                .await
            {
                Ok(item) => return Self::milestone_record(&item),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let mut page = 1usize;
        loop {
            let body = self
                .call(
                    Request::get(self.milestones_path())
                        .query("state", "all")
                        .query("per_page", self.config.per_page)
                        .query("page", page),
                )
                .await?;
            let items = body.as_array().cloned().unwrap_or_default();
            if let Some(item) = items
                .iter()
                .find(|m| str_field(m, "title") == lookup.title)
            {
                return Self::milestone_record(item);
            }
            if items.len() < self.config.per_page {
                break;
            }
            page += 1;
        }
        Err(TrackerError::not_found(
            TrackerKind::GitHub,
            format!("milestone {:?}", lookup.title),
        ))
    }

    // -----------------------------------------------------------------------
    // Projects v2 (views)
    // -----------------------------------------------------------------------

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, TrackerError> {
        let body = self
            .call(Request::post(
                "/graphql",
                json!({ "query": query, "variables": variables }),
            ))
            .await?;
        if let Some(errors) = body
            .get("errors")
            .and_then(Value::as_array)
            .filter(|e| !e.is_empty())
        {
            let rate_limited = errors
                .iter()
                .any(|e| e.get("type").and_then(Value::as_str) == Some("RATE_LIMITED"));
            if rate_limited {
                return Err(TrackerError::RateLimited {
                    tracker: TrackerKind::GitHub,
                    resume_at: Utc::now() + chrono::TimeDelta::seconds(60),
                });
            }
            let message = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TrackerError::permanent(TrackerKind::GitHub, message));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn project_record(node: &Value) -> Result<RemoteRecord, TrackerError> {
        let id = node
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::GitHub, "project without an id"))?;
        let fields = FieldSet {
            title: str_field(node, "title").to_string(),
            extra: decode_extras(str_field(node, "shortDescription")),
            ..FieldSet::default()
        };
        Ok(RemoteRecord::new(
            TrackerKind::GitHub,
            id,
            Some(EntityKind::View),
            None,
            fields,
            timestamp(node, "updatedAt"),
        ))
    }

    async fn owner_projects(&self) -> Result<(String, Vec<Value>), TrackerError> {
        let query = format!(
            "query($login: String!) {{ repositoryOwner(login: $login) {{ id \
             ... on ProjectV2Owner {{ projectsV2(first: 100) {{ nodes {{ {PROJECT_FIELDS} }} }} }} }} }}"
        );
        let data = self
            .graphql(&query, json!({ "login": self.config.owner() }))
            .await?;
        let owner = data.get("repositoryOwner").filter(|o| !o.is_null()).ok_or_else(|| {
            TrackerError::not_found(
                TrackerKind::GitHub,
                format!("project owner {:?}", self.config.owner()),
            )
        })?;
        let owner_id = str_field(owner, "id").to_string();
        let nodes = owner
            .pointer("/projectsV2/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok((owner_id, nodes))
    }

    async fn find_project(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        if let Some(id) = &lookup.key {
            let query = format!(
                "query($id: ID!) {{ node(id: $id) {{ ... on ProjectV2 {{ {PROJECT_FIELDS} }} }} }}"
            );
            let data = self.graphql(&query, json!({ "id": id })).await?;
            if let Some(node) = data.get("node").filter(|n| n.get("id").is_some()) {
                return Self::project_record(node);
            }
        }
        let (_, nodes) = self.owner_projects().await?;
        match nodes.iter().find(|n| str_field(n, "title") == lookup.title) {
            Some(node) => Self::project_record(node),
            None => Err(TrackerError::not_found(
                TrackerKind::GitHub,
                format!("project {:?}", lookup.title),
            )),
        }
    }

    async fn update_project(
        &self,
        project_id: &str,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        let query = format!(
            "mutation($input: UpdateProjectV2Input!) {{ updateProjectV2(input: $input) \
             {{ projectV2 {{ {PROJECT_FIELDS} }} }} }}"
        );
        let data = self
            .graphql(
                &query,
                json!({ "input": {
                    "projectId": project_id,
                    "title": artifact.fields.title,
                    "shortDescription": encode_extras(&artifact.fields.extra),
                }}),
            )
            .await?;
        let node = data
            .pointer("/updateProjectV2/projectV2")
            .ok_or_else(|| TrackerError::permanent(TrackerKind::GitHub, "empty project update"))?;
        let record = Self::project_record(node)?;
        self.add_project_items(project_id, &artifact.items).await?;
        Ok(record)
    }

    /// Add issues (by number) to a project. Re-adding an issue the project
    /// already holds is a no-op on GitHub's side.
    async fn add_project_items(
        &self,
        project_id: &str,
        numbers: &[String],
    ) -> Result<(), TrackerError> {
        let query = "mutation($input: AddProjectV2ItemByIdInput!) { \
                     addProjectV2ItemById(input: $input) { item { id } } }";
        for number in numbers {
            let issue = self
                .call(Request::get(format!("{}/{number}", self.issues_path())))
                .await?;
            let content_id = issue.get("node_id").and_then(Value::as_str).ok_or_else(|| {
                TrackerError::permanent(
                    TrackerKind::GitHub,
                    format!("issue {number} without a node id"),
                )
            })?;
            self.graphql(
                query,
                json!({ "input": { "projectId": project_id, "contentId": content_id }}),
            )
            .await?;
        }
        if !numbers.is_empty() {
            tracing::debug!(
                tracker = "github",
                project = %project_id,
                items = numbers.len(),
                "added project items"
            );
        }
        Ok(())
    }

    async fn create_project(&self, artifact: &ArtifactDraft) -> Result<RemoteRecord, TrackerError> {
        let (owner_id, _) = self.owner_projects().await?;
        let query = "mutation($input: CreateProjectV2Input!) { createProjectV2(input: $input) \
                     { projectV2 { id } } }";
        let data = self
            .graphql(
                query,
                json!({ "input": { "ownerId": owner_id, "title": artifact.fields.title }}),
            )
            .await?;
        let project_id = data
            .pointer("/createProjectV2/projectV2/id")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::GitHub, "empty project create"))?
            .to_string();
        // Creation takes only a title; the extras follow in a second call.
        self.update_project(&project_id, artifact).await
    }
}

#[async_trait]
impl TrackerAdapter for GitHubAdapter {
    fn kind(&self) -> TrackerKind {
        TrackerKind::GitHub
    }

    fn list_issues<'a>(
        &'a self,
        filter: &'a IssueFilter,
    ) -> BoxStream<'a, Result<RemoteRecord, TrackerError>> {
        Box::pin(try_stream! {
            let state = if filter.include_closed { "all" } else { "open" };
            let mut page = 1usize;
            loop {
                let body = self
                    .call(
                        Request::get(self.issues_path())
                            .query("state", state)
                            .query("per_page", self.config.per_page)
                            .query("page", page),
                    )
                    .await?;
                let items = body.as_array().cloned().unwrap_or_default();
                for item in &items {
                    // The issues endpoint also returns pull requests.
                    if item.get("pull_request").is_some() {
                        continue;
                    }
                    yield self.issue_record(item, None)?;
                }
                if items.len() < self.config.per_page {
                    break;
                }
                page += 1;
            }
        })
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteRecord, TrackerError> {
        let item = self
            .call(Request::post(self.issues_path(), self.issue_payload(draft)))
            .await?;
        let record = self.issue_record(&item, Some(draft.kind))?;
        tracing::info!(
            tracker = "github",
            entity = %draft.plan_id,
            remote_id = %record.remote_id,
            "created issue"
        );
        Ok(record)
    }

    async fn update_issue(
        &self,
        remote_id: &str,
        draft: &IssueDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        let item = self
            .call(Request::patch(
                format!("{}/{remote_id}", self.issues_path()),
                self.issue_payload(draft),
            ))
            .await?;
        self.issue_record(&item, Some(draft.kind))
    }

    async fn find_by_title_or_key(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        match lookup.kind {
            EntityKind::Epic | EntityKind::Story => self.find_issue(lookup).await,
            EntityKind::Sprint => self.find_milestone(lookup).await,
            EntityKind::View => self.find_project(lookup).await,
        }
    }

    async fn create_project_artifact(
        &self,
        kind: EntityKind,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        match kind {
            EntityKind::Sprint => {
                let item = self
                    .call(Request::post(
                        self.milestones_path(),
                        Self::milestone_payload(artifact),
                    ))
                    .await?;
                Self::milestone_record(&item)
            }
            EntityKind::View => self.create_project(artifact).await,
            other => Err(TrackerError::permanent(
                TrackerKind::GitHub,
                format!("{other} is not a project artifact"),
            )),
        }
    }

    async fn update_project_artifact(
        &self,
        kind: EntityKind,
        remote_id: &str,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        match kind {
            EntityKind::Sprint => {
                let item = self
                    .call(Request::patch(
                        format!("{}/{remote_id}", self.milestones_path()),
                        Self::milestone_payload(artifact),
                    ))
                    .await?;
                Self::milestone_record(&item)
            }
            EntityKind::View => self.update_project(remote_id, artifact).await,
            other => Err(TrackerError::permanent(
                TrackerKind::GitHub,
                format!("{other} is not a project artifact"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn issue_labels(draft: &IssueDraft) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    if draft.kind == EntityKind::Story {
        labels.extend(
            draft
                .fields
                .labels
                .iter()
                .filter(|l| !is_convention_label(l))
                .cloned(),
        );
    }
    labels.push(format!("{KIND_PREFIX}{}", draft.kind));
    labels.push(format!("{ID_PREFIX}{}", draft.plan_id));
    if draft.kind == EntityKind::Story {
        if let Some(status) = &draft.fields.status {
            labels.push(format!("{STATUS_PREFIX}{status}"));
        }
        if let Some(points) = draft.fields.points {
            labels.push(format!("{POINTS_PREFIX}{points}"));
        }
        if let Some(parent) = &draft.parent {
            labels.push(format!("{EPIC_PREFIX}{}", parent.plan_id));
        }
    }
    labels
}

fn is_convention_label(label: &str) -> bool {
    CONVENTION_PREFIXES.iter().any(|p| label.starts_with(p))
}

fn label_value<'a>(labels: &'a [String], prefix: &str) -> Option<&'a str> {
    labels.iter().find_map(|l| l.strip_prefix(prefix))
}

fn str_field<'v>(value: &'v Value, key: &str) -> &'v str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(str_field(value, key))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}
