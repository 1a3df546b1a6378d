//! File-backed plan store.
//!
//! `load` parses and validates eagerly so a malformed plan never reaches
//! the sync pipeline. `save` writes `<path>.tmp` then renames it over the
//! plan file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::PlanError;
use super::model::{EntityKey, Plan, PlanEntity};
use super::validate::validate_plan;

/// Parse and validate plan JSON.
pub fn parse_plan(content: &str) -> Result<Plan, PlanError> {
    let plan: Plan = serde_json::from_str(content).map_err(PlanError::Parse)?;
    let issues = validate_plan(&plan);
    if !issues.is_empty() {
        return Err(PlanError::Invalid { issues });
    }
    Ok(plan)
}

/// The JSON plan file that acts as source of truth.
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the plan.
    pub fn load(&self) -> Result<Plan, PlanError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| PlanError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut plan = parse_plan(&content)?;
        plan.file_modified_at = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        tracing::debug!(
            path = %self.path.display(),
            epics = plan.epics.len(),
            stories = plan.stories.len(),
            sprints = plan.sprints.len(),
            views = plan.views.len(),
            "loaded plan"
        );
        Ok(plan)
    }

    /// Load the plan and return one entity.
    pub fn entity_by_id(&self, key: &EntityKey) -> Result<PlanEntity, PlanError> {
        self.load()?
            .entity_by_id(key)
            .ok_or_else(|| PlanError::NotFound(key.clone()))
    }

    /// Persist the plan atomically.
    ///
    /// Sibling lists keep their order and unknown keys are written back, so
    /// re-saving an unchanged plan yields byte-identical output.
    pub fn save(&self, plan: &Plan) -> Result<(), PlanError> {
        let mut json = serde_json::to_string_pretty(plan).map_err(PlanError::Serialize)?;
        json.push('\n');

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| PlanError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|source| PlanError::Io {
            path: tmp.clone(),
            source,
        })?;
        if let Err(source) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(PlanError::Io {
                path: self.path.clone(),
                source,
            });
        }
        tracing::info!(path = %self.path.display(), "saved plan");
        Ok(())
    }
}
