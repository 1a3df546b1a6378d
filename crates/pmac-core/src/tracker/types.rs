//! Types shared by every tracker adapter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, FieldSet};
use crate::plan::EntityKind;

/// The remote systems a plan is reconciled against.
///
/// Ordering is the order changes for one entity are emitted in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum TrackerKind {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "jira")]
    Jira,
}

impl TrackerKind {
    pub const ALL: [TrackerKind; 2] = [TrackerKind::GitHub, TrackerKind::Jira];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackerKind::GitHub => "github",
            TrackerKind::Jira => "jira",
        }
    }
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(TrackerKind::GitHub),
            "jira" => Ok(TrackerKind::Jira),
            other => Err(format!(
                "unknown tracker {other:?} (expected github or jira)"
            )),
        }
    }
}

/// A remote issue or artifact, normalized to the logical field set.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub tracker: TrackerKind,
    /// Issue number, issue key, milestone number, sprint id, or node id.
    pub remote_id: String,
    /// Entity kind inferred from the remote record, when it carries one.
    pub kind: Option<EntityKind>,
    /// Plan id recovered from the record's labels, when present.
    pub plan_id: Option<String>,
    pub fields: FieldSet,
    pub remote_hash: ContentHash,
    /// Remote modification time, when the tracker reports one.
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl RemoteRecord {
    pub fn new(
        tracker: TrackerKind,
        remote_id: impl Into<String>,
        kind: Option<EntityKind>,
        plan_id: Option<String>,
        fields: FieldSet,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Self {
        let remote_hash = fields.digest();
        Self {
            tracker,
            remote_id: remote_id.into(),
            kind,
            plan_id,
            fields,
            remote_hash,
            last_seen_at,
        }
    }
}

/// Filter for [`super::TrackerAdapter::list_issues`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    pub include_closed: bool,
}

impl IssueFilter {
    /// Every issue, open or closed.
    pub fn all() -> Self {
        Self {
            include_closed: true,
        }
    }
}

/// Dedup lookup: match on key first, then on exact title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub kind: EntityKind,
    pub plan_id: String,
    pub title: String,
    /// Remote id from the mapping table, when one exists.
    pub key: Option<String>,
}

/// Remote side of a story's epic, resolved from the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub plan_id: String,
    pub remote_id: String,
}

/// Fields to write to an epic or story issue.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDraft {
    pub kind: EntityKind,
    pub plan_id: String,
    pub fields: FieldSet,
    pub parent: Option<ParentLink>,
}

/// Fields to write to a sprint or view artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDraft {
    pub plan_id: String,
    pub fields: FieldSet,
    /// Remote ids of the issues a view should hold. Empty for sprints.
    pub items: Vec<String>,
}
