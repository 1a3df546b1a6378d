//! Jira Cloud adapter.
//!
//! Epics and stories are issues in the configured project, found through
//! JQL and tagged with a `pmac:<id>` label. Status changes go through
//! workflow transitions. Sprints use the Agile sprint API on the configured
//! board; views are Agile boards, which Jira exposes read-mostly: a board
//! is compared by name only and cannot be updated.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{Map, Value, json};

use super::error::TrackerError;
use super::trait_def::TrackerAdapter;
use super::transport::{self, Request, Transport};
use super::types::{ArtifactDraft, IssueDraft, IssueFilter, Lookup, RemoteRecord, TrackerKind};
use crate::hash::FieldSet;
use crate::plan::EntityKind;
use crate::plan::model::{EXTRA_END, EXTRA_START};

const ID_LABEL_PREFIX: &str = "pmac:";
const ISSUE_PATH: &str = "/rest/api/2/issue";
const SEARCH_PATH: &str = "/rest/api/2/search";
const SPRINT_PATH: &str = "/rest/agile/1.0/sprint";
const BOARD_PATH: &str = "/rest/agile/1.0/board";

#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub project_key: String,
    /// Board that owns sprints.
    pub board_id: Option<u64>,
    /// Custom field holding story points.
    pub story_points_field: String,
    /// Saved filter new boards are created from.
    pub filter_id: Option<u64>,
    pub page_size: usize,
}

impl JiraConfig {
    pub fn new(project_key: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            board_id: None,
            story_points_field: "customfield_10016".to_string(),
            filter_id: None,
            page_size: 50,
        }
    }
}

pub struct JiraAdapter {
    config: JiraConfig,
    transport: Arc<dyn Transport>,
}

impl JiraAdapter {
    pub fn new(config: JiraConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    async fn call(&self, request: Request) -> Result<Value, TrackerError> {
        transport::call(self.transport.as_ref(), TrackerKind::Jira, request).await
    }

    fn issue_fields_param(&self) -> String {
        format!(
            "summary,description,labels,status,issuetype,updated,{}",
            self.config.story_points_field
        )
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    fn issue_payload(&self, draft: &IssueDraft, creating: bool) -> Value {
        let mut fields = Map::new();
        fields.insert("summary".into(), json!(draft.fields.title));
        fields.insert("description".into(), json!(draft.fields.description));

        let mut labels: Vec<String> = Vec::new();
        if draft.kind == EntityKind::Story {
            labels.extend(
                draft
                    .fields
                    .labels
                    .iter()
                    .filter(|l| !l.starts_with(ID_LABEL_PREFIX))
                    .cloned(),
            );
            if let Some(points) = draft.fields.points {
                fields.insert(self.config.story_points_field.clone(), json!(points));
            }
            if let Some(parent) = &draft.parent {
                fields.insert("parent".into(), json!({ "key": parent.remote_id }));
            }
        }
        labels.push(format!("{ID_LABEL_PREFIX}{}", draft.plan_id));
        fields.insert("labels".into(), json!(labels));

        if creating {
            fields.insert(
                "project".into(),
                json!({ "key": self.config.project_key }),
            );
            let issue_type = match draft.kind {
                EntityKind::Epic => "Epic",
                _ => "Story",
            };
            fields.insert("issuetype".into(), json!({ "name": issue_type }));
        }
        json!({ "fields": fields })
    }

    fn issue_record(
        &self,
        issue: &Value,
        hint: Option<EntityKind>,
    ) -> Result<RemoteRecord, TrackerError> {
        let key = issue
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::Jira, "issue without a key"))?;
        let fields = issue.get("fields").cloned().unwrap_or(Value::Null);

        let kind = fields
            .pointer("/issuetype/name")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<EntityKind>().ok())
            .filter(|k| k.is_issue())
            .or(hint);
        let labels: Vec<String> = fields
            .get("labels")
            .and_then(Value::as_array)
            .map(|ls| {
                ls.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let plan_id = labels
            .iter()
            .find_map(|l| l.strip_prefix(ID_LABEL_PREFIX))
            .map(str::to_string);

        let mut logical = FieldSet {
            title: str_field(&fields, "summary").to_string(),
            description: str_field(&fields, "description").to_string(),
            ..FieldSet::default()
        };
        if kind != Some(EntityKind::Epic) {
            logical.labels = labels
                .into_iter()
                .filter(|l| !l.starts_with(ID_LABEL_PREFIX))
                .collect();
            logical.status = fields
                .pointer("/status/name")
                .and_then(Value::as_str)
                .map(str::to_string);
            logical.points = fields
                .get(&self.config.story_points_field)
                .and_then(Value::as_f64)
                .map(|p| p.round() as i64);
        }

        Ok(RemoteRecord::new(
            TrackerKind::Jira,
            key,
            kind,
            plan_id,
            logical,
            jira_timestamp(str_field(&fields, "updated")),
        ))
    }

    async fn get_issue(&self, key: &str, hint: Option<EntityKind>) -> Result<RemoteRecord, TrackerError> {
        let issue = self
            .call(
                Request::get(format!("{ISSUE_PATH}/{key}"))
                    .query("fields", self.issue_fields_param()),
            )
            .await?;
        self.issue_record(&issue, hint)
    }

    async fn search(&self, jql: &str, start_at: usize) -> Result<Value, TrackerError> {
        self.call(
            Request::get(SEARCH_PATH)
                .query("jql", jql)
                .query("startAt", start_at)
                .query("maxResults", self.config.page_size)
                .query("fields", self.issue_fields_param()),
        )
        .await
    }

    /// Move the issue into `status` if it is not already there.
    async fn transition_to(&self, key: &str, status: &str) -> Result<(), TrackerError> {
        let body = self
            .call(Request::get(format!("{ISSUE_PATH}/{key}/transitions")))
            .await?;
        let transitions = body
            .get("transitions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let Some(transition_id) = transitions
            .iter()
            .find(|t| t.pointer("/to/name").and_then(Value::as_str) == Some(status))
            .and_then(|t| t.get("id").and_then(Value::as_str))
        else {
            return Err(TrackerError::permanent(
                TrackerKind::Jira,
                format!("no workflow transition from {key} to status {status:?}"),
            ));
        };
        self.call(Request::post(
            format!("{ISSUE_PATH}/{key}/transitions"),
            json!({ "transition": { "id": transition_id } }),
        ))
        .await?;
        tracing::debug!(tracker = "jira", remote_id = %key, status = %status, "transitioned issue");
        Ok(())
    }

    /// Write `draft` to an existing issue: fields, then status, then read back.
    async fn write_issue(&self, key: &str, draft: &IssueDraft) -> Result<RemoteRecord, TrackerError> {
        let mut record = self.get_issue(key, Some(draft.kind)).await?;
        if draft.kind == EntityKind::Story {
            if let Some(status) = draft.fields.status.as_deref() {
                if record.fields.status.as_deref() != Some(status) {
                    self.transition_to(key, status).await?;
                    record = self.get_issue(key, Some(draft.kind)).await?;
                }
            }
        }
        Ok(record)
    }

    async fn find_issue(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        if let Some(key) = &lookup.key {
            match self.get_issue(key, Some(lookup.kind)).await {
                Ok(record) => return Ok(record),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let project = jql_quote(&self.config.project_key);
        let by_label = self
            .search(
                &format!(
                    "project = {project} AND labels = {}",
                    jql_quote(&format!("{ID_LABEL_PREFIX}{}", lookup.plan_id))
                ),
                0,
            )
            .await?;
        for issue in issues_of(&by_label) {
            let record = self.issue_record(issue, Some(lookup.kind))?;
            if record.kind == Some(lookup.kind) {
                return Ok(record);
            }
        }

        let by_title = self
            .search(
                &format!(
                    "project = {project} AND summary ~ {}",
                    jql_quote(&lookup.title)
                ),
                0,
            )
            .await?;
        for issue in issues_of(&by_title) {
            let record = self.issue_record(issue, Some(lookup.kind))?;
            if record.fields.title == lookup.title && record.kind == Some(lookup.kind) {
                return Ok(record);
            }
        }

        Err(TrackerError::not_found(
            TrackerKind::Jira,
            format!("{} {:?}", lookup.kind, lookup.title),
        ))
    }

    // -----------------------------------------------------------------------
    // Sprints
    // -----------------------------------------------------------------------

    fn board_id(&self) -> Result<u64, TrackerError> {
        self.config.board_id.ok_or_else(|| {
            TrackerError::permanent(TrackerKind::Jira, "jira.board_id is not configured")
        })
    }

    fn sprint_payload(artifact: &ArtifactDraft) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("name".into(), json!(artifact.fields.title));
        if let Some(start) = artifact.fields.extra.get(EXTRA_START) {
            payload.insert("startDate".into(), json!(format!("{start}T00:00:00.000Z")));
        }
        if let Some(end) = artifact.fields.extra.get(EXTRA_END) {
            payload.insert("endDate".into(), json!(format!("{end}T00:00:00.000Z")));
        }
        payload
    }

    fn sprint_record(sprint: &Value) -> Result<RemoteRecord, TrackerError> {
        let id = sprint
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::Jira, "sprint without an id"))?;
        let mut fields = FieldSet::new(str_field(sprint, "name"));
        for (json_key, extra_key) in [("startDate", EXTRA_START), ("endDate", EXTRA_END)] {
            if let Some(date) = str_field(sprint, json_key).get(..10) {
                fields.extra.insert(extra_key.to_string(), date.to_string());
            }
        }
        Ok(RemoteRecord::new(
            TrackerKind::Jira,
            id.to_string(),
            Some(EntityKind::Sprint),
            None,
            fields,
            // Agile sprints carry no modification time.
            None,
        ))
    }

    async fn find_sprint(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        if let Some(id) = &lookup.key {
            match self.call(Request::get(format!("{SPRINT_PATH}/{id}"))).await {
                Ok(sprint) => return Self::sprint_record(&sprint),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let board_id = self.board_id()?;
        let mut start_at = 0usize;
        loop {
            let body = self
                .call(
                    Request::get(format!("{BOARD_PATH}/{board_id}/sprint"))
                        .query("startAt", start_at)
                        .query("maxResults", self.config.page_size),
                )
                .await?;
            let values = values_of(&body);
            if let Some(sprint) = values.iter().find(|s| str_field(s, "name") == lookup.title) {
                return Self::sprint_record(sprint);
            }
            let is_last = body.get("isLast").and_then(Value::as_bool).unwrap_or(true);
            if is_last || values.is_empty() {
                break;
            }
            start_at += values.len();
        }
        Err(TrackerError::not_found(
            TrackerKind::Jira,
            format!("sprint {:?}", lookup.title),
        ))
    }

    // -----------------------------------------------------------------------
    // Boards
    // -----------------------------------------------------------------------

    fn board_record(board: &Value) -> Result<RemoteRecord, TrackerError> {
        let id = board
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::Jira, "board without an id"))?;
        Ok(RemoteRecord::new(
            TrackerKind::Jira,
            id.to_string(),
            Some(EntityKind::View),
            None,
            FieldSet::new(str_field(board, "name")),
            None,
        ))
    }

    async fn find_board(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        if let Some(id) = &lookup.key {
            match self.call(Request::get(format!("{BOARD_PATH}/{id}"))).await {
                Ok(board) => return Self::board_record(&board),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let body = self
            .call(
                Request::get(BOARD_PATH)
                    .query("name", &lookup.title)
                    .query("projectKeyOrId", &self.config.project_key),
            )
            .await?;
        match values_of(&body)
            .iter()
            .find(|b| str_field(b, "name") == lookup.title)
        {
            Some(board) => Self::board_record(board),
            None => Err(TrackerError::not_found(
                TrackerKind::Jira,
                format!("board {:?}", lookup.title),
            )),
        }
    }
}

#[async_trait]
impl TrackerAdapter for JiraAdapter {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Jira
    }

    fn representable_fields(&self, kind: EntityKind, fields: &FieldSet) -> FieldSet {
        match kind {
            // Board type and columns are not writable through the API.
            EntityKind::View => FieldSet::new(fields.title.clone()),
            _ => fields.clone(),
        }
    }

    fn list_issues<'a>(
        &'a self,
        filter: &'a IssueFilter,
    ) -> BoxStream<'a, Result<RemoteRecord, TrackerError>> {
        Box::pin(try_stream! {
            let mut jql = format!(
                "project = {} AND issuetype in (Epic, Story)",
                jql_quote(&self.config.project_key)
            );
            if !filter.include_closed {
                jql.push_str(" AND statusCategory != Done");
            }
            jql.push_str(" ORDER BY key ASC");

            let mut start_at = 0usize;
            loop {
                let body = self.search(&jql, start_at).await?;
                let issues = issues_of(&body);
                for issue in issues {
                    yield self.issue_record(issue, None)?;
                }
                let total = body.get("total").and_then(Value::as_u64).unwrap_or(0) as usize;
                start_at += issues.len();
                if issues.is_empty() || start_at >= total {
                    break;
                }
            }
        })
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<RemoteRecord, TrackerError> {
        let created = self
            .call(Request::post(ISSUE_PATH, self.issue_payload(draft, true)))
            .await?;
        let key = created
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::permanent(TrackerKind::Jira, "create returned no key"))?
            .to_string();
        tracing::info!(tracker = "jira", entity = %draft.plan_id, remote_id = %key, "created issue");
        self.write_issue(&key, draft).await
    }

    async fn update_issue(
        &self,
        remote_id: &str,
        draft: &IssueDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        self.call(Request::put(
            format!("{ISSUE_PATH}/{remote_id}"),
            self.issue_payload(draft, false),
        ))
        .await?;
        self.write_issue(remote_id, draft).await
    }

    async fn find_by_title_or_key(&self, lookup: &Lookup) -> Result<RemoteRecord, TrackerError> {
        match lookup.kind {
            EntityKind::Epic | EntityKind::Story => self.find_issue(lookup).await,
            EntityKind::Sprint => self.find_sprint(lookup).await,
            EntityKind::View => self.find_board(lookup).await,
        }
    }

    async fn create_project_artifact(
        &self,
        kind: EntityKind,
        artifact: &ArtifactDraft,
    ) -> Result<RemoteRecord, TrackerError> {
        match kind {
            EntityKind::Sprint => {
                let mut payload = Self::sprint_payload(artifact);
                payload.insert("originBoardId".into(), json!(self.board_id()?));
                let sprint = self
                    .call(Request::post(SPRINT_PATH, Value::Object(payload)))
                    .await?;
                Self::sprint_record(&sprint)
            }
            EntityKind::View => {
                let filter_id = self.config.filter_id.ok_or_else(|| {
                    TrackerError::permanent(
                        TrackerKind::Jira,
                        "jira.filter_id is required to create boards",
                    )
                })?;
                let board_type = match artifact.fields.extra.get("type").map(String::as_str) {
                    Some("scrum") => "scrum",
                    _ => "kanban",
                };
                let board = self
                    .call(Request::post(
                        BOARD_PATH,
                        json!({
                            "name": artifact.fields.title,
                            "type": board_type,
                            "filterId": filter_id,
                        }),
                    ))
                    .await?;
                Self::board_record(&board)
            }
            other => Err(TrackerError::permanent(
                TrackerKind::Jira,
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
                // The sprint endpoint treats POST as a partial update.
                let sprint = self
                    .call(Request::post(
                        format!("{SPRINT_PATH}/{remote_id}"),
                        Value::Object(Self::sprint_payload(artifact)),
                    ))
                    .await?;
                Self::sprint_record(&sprint)
            }
            EntityKind::View => Err(TrackerError::permanent(
                TrackerKind::Jira,
                "Jira boards cannot be updated through the API",
            )),
            other => Err(TrackerError::permanent(
                TrackerKind::Jira,
                format!("{other} is not a project artifact"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn str_field<'v>(value: &'v Value, key: &str) -> &'v str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn issues_of(body: &Value) -> &[Value] {
    body.get("issues")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn values_of(body: &Value) -> &[Value] {
    body.get("values")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Quote a JQL string literal.
fn jql_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Jira timestamps look like `2025-01-06T10:00:00.000+0000`.
fn jira_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
