//! Plan document types and the entity view the reconciler works on.
//!
//! The serde types mirror the JSON plan file one-to-one. Unknown keys are
//! kept in the `extra` maps so a load/save cycle never drops user data.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::{ContentHash, FieldSet};

/// Statuses accepted when the project does not declare its own set.
pub const DEFAULT_STATUSES: [&str; 4] = ["To Do", "In Progress", "Review", "Done"];

/// Label prefixes the trackers use for plan metadata. A plan label with one
/// of these prefixes would be swallowed by the metadata on write.
pub const RESERVED_LABEL_PREFIXES: [&str; 6] =
    ["kind:", "id:", "status:", "points:", "epic:", "pmac:"];

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The kinds of entity a plan declares.
///
/// Declaration order is dependency order: epics before the stories that
/// reference them, stories before the sprints that list them, views last.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Epic,
    Story,
    Sprint,
    View,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Epic,
        EntityKind::Story,
        EntityKind::Sprint,
        EntityKind::View,
    ];

    /// Epics and stories are tracker issues; sprints and views are project
    /// artifacts (milestones, boards, sprints, projects).
    pub fn is_issue(self) -> bool {
        matches!(self, EntityKind::Epic | EntityKind::Story)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Epic => "epic",
            EntityKind::Story => "story",
            EntityKind::Sprint => "sprint",
            EntityKind::View => "view",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "epic" => Ok(EntityKind::Epic),
            "story" => Ok(EntityKind::Story),
            "sprint" => Ok(EntityKind::Sprint),
            "view" => Ok(EntityKind::View),
            other => Err(format!(
                "unknown entity kind {other:?} (expected epic, story, sprint, or view)"
            )),
        }
    }
}

/// Stable identity of a plan entity: its kind plus its id within that kind.
///
/// Ordering is (kind, id), which is exactly the order changes are emitted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn epic(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Epic, id)
    }

    pub fn story(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Story, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Plan document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    #[serde(default)]
    pub project_key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Allowed story statuses; empty means [`DEFAULT_STATUSES`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub epic_id: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    /// Signed so that a negative value reaches validation instead of
    /// failing deserialization with a less useful message.
    pub story_points: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprint {
    /// Sprint names double as their identity.
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub stories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// View names double as their identity.
    pub name: String,
    #[serde(rename = "type")]
    pub view_type: String,
    #[serde(default)]
    pub columns: Vec<String>,
    /// Column name to the stories placed in it when the board is set up.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub initial_assignments: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The whole plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub project: ProjectMeta,
    #[serde(default)]
    pub epics: Vec<Epic>,
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(default)]
    pub sprints: Vec<Sprint>,
    #[serde(default)]
    pub views: Vec<View>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Modification time of the file the plan was loaded from. Used when an
    /// entity carries no `updated_at` of its own.
    #[serde(skip)]
    pub file_modified_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Entity view
// ---------------------------------------------------------------------------

/// One plan entity as the reconciler sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntity {
    pub key: EntityKey,
    /// The epic a story belongs to.
    pub parent: Option<EntityKey>,
    pub fields: FieldSet,
    pub content_hash: ContentHash,
    pub modified_at: Option<DateTime<Utc>>,
    /// Stories a view places on its board. Not part of the content hash.
    pub members: Vec<EntityKey>,
}

impl PlanEntity {
    fn new(
        key: EntityKey,
        parent: Option<EntityKey>,
        fields: FieldSet,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        let content_hash = fields.digest();
        Self {
            key,
            parent,
            fields,
            content_hash,
            modified_at,
            members: Vec::new(),
        }
    }

    fn with_members(mut self, members: Vec<EntityKey>) -> Self {
        self.members = members;
        self
    }
}

pub(crate) const EXTRA_START: &str = "start_date";
pub(crate) const EXTRA_END: &str = "end_date";
pub(crate) const EXTRA_VIEW_TYPE: &str = "type";
pub(crate) const EXTRA_COLUMNS: &str = "columns";

impl Epic {
    pub fn key(&self) -> EntityKey {
        EntityKey::epic(&self.id)
    }

    pub fn fields(&self) -> FieldSet {
        FieldSet {
            title: self.title.clone(),
            description: self.description.clone(),
            ..FieldSet::default()
        }
    }
}

impl Story {
    pub fn key(&self) -> EntityKey {
        EntityKey::story(&self.id)
    }

    pub fn fields(&self) -> FieldSet {
        FieldSet {
            title: self.summary.clone(),
            description: self.description.clone(),
            labels: self.labels.clone(),
            status: Some(self.status.clone()),
            points: Some(self.story_points),
            extra: BTreeMap::new(),
        }
    }
}

impl Sprint {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(EntityKind::Sprint, &self.name)
    }

    pub fn fields(&self) -> FieldSet {
        let mut extra = BTreeMap::new();
        extra.insert(EXTRA_START.to_string(), self.start_date.to_string());
        extra.insert(EXTRA_END.to_string(), self.end_date.to_string());
        FieldSet {
            title: self.name.clone(),
            extra,
            ..FieldSet::default()
        }
    }
}

impl View {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(EntityKind::View, &self.name)
    }

    /// Assigned stories in column order, each once.
    pub fn assigned_stories(&self) -> Vec<EntityKey> {
        let mut out: Vec<EntityKey> = Vec::new();
        for column in &self.columns {
            for id in self.initial_assignments.get(column).into_iter().flatten() {
                let key = EntityKey::story(id);
                if !out.contains(&key) {
                    out.push(key);
                }
            }
        }
        out
    }

    pub fn fields(&self) -> FieldSet {
        let mut extra = BTreeMap::new();
        extra.insert(EXTRA_VIEW_TYPE.to_string(), self.view_type.clone());
        extra.insert(EXTRA_COLUMNS.to_string(), self.columns.join(","));
        FieldSet {
            title: self.name.clone(),
            extra,
            ..FieldSet::default()
        }
    }
}

impl Plan {
    /// Statuses a story may carry in this project.
    pub fn allowed_statuses(&self) -> Vec<String> {
        if self.project.statuses.is_empty() {
            DEFAULT_STATUSES.iter().map(|s| s.to_string()).collect()
        } else {
            self.project.statuses.clone()
        }
    }

    /// Every entity in declaration order (epics, stories, sprints, views).
    pub fn entities(&self) -> Vec<PlanEntity> {
        let fallback = self.file_modified_at;
        let mut out = Vec::with_capacity(
            self.epics.len() + self.stories.len() + self.sprints.len() + self.views.len(),
        );
        for epic in &self.epics {
            out.push(PlanEntity::new(
                epic.key(),
                None,
                epic.fields(),
                epic.updated_at.or(fallback),
            ));
        }
        for story in &self.stories {
            let parent = story
                .epic_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(EntityKey::epic);
            out.push(PlanEntity::new(
                story.key(),
                parent,
                story.fields(),
                story.updated_at.or(fallback),
            ));
        }
        for sprint in &self.sprints {
            out.push(PlanEntity::new(
                sprint.key(),
                None,
                sprint.fields(),
                sprint.updated_at.or(fallback),
            ));
        }
        for view in &self.views {
            out.push(
                PlanEntity::new(view.key(), None, view.fields(), view.updated_at.or(fallback))
                    .with_members(view.assigned_stories()),
            );
        }
        out
    }

    /// Look up one entity by kind and id.
    pub fn entity_by_id(&self, key: &EntityKey) -> Option<PlanEntity> {
        self.entities().into_iter().find(|e| &e.key == key)
    }

    /// Merge a field set pulled from a tracker into the plan.
    ///
    /// Identity fields (sprint and view names) are never rewritten, and a
    /// status outside the project's set is left untouched. Returns whether
    /// anything changed.
    pub fn apply_inbound(
        &mut self,
        key: &EntityKey,
        fields: &FieldSet,
        seen_at: DateTime<Utc>,
    ) -> bool {
        let allowed = self.allowed_statuses();
        match key.kind {
            EntityKind::Epic => {
                let Some(epic) = self.epics.iter_mut().find(|e| e.id == key.id) else {
                    return false;
                };
                let before = epic.fields();
                epic.title = fields.title.clone();
                epic.description = fields.description.clone();
                let changed = before != epic.fields();
                if changed {
                    epic.updated_at = Some(seen_at);
                }
                changed
            }
            EntityKind::Story => {
                let Some(story) = self.stories.iter_mut().find(|s| s.id == key.id) else {
                    return false;
                };
                let before = story.fields();
                story.summary = fields.title.clone();
                story.description = fields.description.clone();
                story.labels = fields.labels.clone();
                if let Some(status) = &fields.status {
                    if allowed.iter().any(|s| s == status) {
                        story.status = status.clone();
                    } else {
                        tracing::warn!(
                            entity = %key,
                            status = %status,
                            "inbound status is not in the project's status set; keeping plan value"
                        );
                    }
                }
                if let Some(points) = fields.points.filter(|p| *p >= 0) {
                    story.story_points = points;
                }
                let changed = before != story.fields();
                if changed {
                    story.updated_at = Some(seen_at);
                }
                changed
            }
            EntityKind::Sprint => {
                let Some(sprint) = self.sprints.iter_mut().find(|s| s.name == key.id) else {
                    return false;
                };
                let before = sprint.fields();
                let start = fields.extra.get(EXTRA_START).and_then(|d| d.parse().ok());
                let end = fields.extra.get(EXTRA_END).and_then(|d| d.parse().ok());
                if let (Some(start), Some(end)) = (start, end) {
                    if start <= end {
                        sprint.start_date = start;
                        sprint.end_date = end;
                    }
                }
                let changed = before != sprint.fields();
                if changed {
                    sprint.updated_at = Some(seen_at);
                }
                changed
            }
            EntityKind::View => {
                let Some(view) = self.views.iter_mut().find(|v| v.name == key.id) else {
                    return false;
                };
                let before = view.fields();
                if let Some(view_type) = fields.extra.get(EXTRA_VIEW_TYPE) {
                    view.view_type = view_type.clone();
                }
                if let Some(columns) = fields.extra.get(EXTRA_COLUMNS) {
                    view.columns = columns
                        .split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                let changed = before != view.fields();
                if changed {
                    view.updated_at = Some(seen_at);
                }
                changed
            }
        }
    }
}
