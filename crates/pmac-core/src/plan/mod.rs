//! The project plan: JSON document model, validation, and file store.

pub mod model;
pub mod store;
pub mod validate;

use std::path::PathBuf;

use thiserror::Error;

pub use model::{
    DEFAULT_STATUSES, EntityKey, EntityKind, Epic, Plan, PlanEntity, ProjectMeta,
    RESERVED_LABEL_PREFIXES, Sprint, Story, View,
};
pub use store::{PlanStore, parse_plan};
pub use validate::{ValidationIssue, validate_plan};

/// Errors raised while loading, validating, or saving the plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to access plan file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plan JSON parse error: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("plan is invalid ({} issue(s)): {}", .issues.len(), render_issues(.issues))]
    Invalid { issues: Vec<ValidationIssue> },

    #[error("no {} with id {:?} in the plan", .0.kind, .0.id)]
    NotFound(EntityKey),

    #[error("failed to serialize plan: {0}")]
    Serialize(#[source] serde_json::Error),
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
