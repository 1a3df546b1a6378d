//! Plan validation.
//!
//! Runs once at load time and collects every violation:
//! - Ids are non-empty and unique within their kind.
//! - Story points are non-negative; statuses belong to the project's set.
//! - `epic_id` references an existing epic.
//! - Epic and sprint story lists reference existing stories.
//! - Sprint dates are ordered (`start_date <= end_date`).
//! - Story labels stay clear of the trackers' metadata prefixes.
//! - View assignments name declared columns and existing stories.

use std::collections::HashSet;
use std::fmt;

use super::model::{EntityKey, EntityKind, Plan, RESERVED_LABEL_PREFIXES};

/// A single validation failure, scoped to the entity it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub entity: Option<EntityKey>,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(key) => write!(f, "{key}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validate a parsed plan, returning every issue found.
pub fn validate_plan(plan: &Plan) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut push = |entity: Option<EntityKey>, message: String| {
        issues.push(ValidationIssue { entity, message });
    };

    let epic_ids = unique_ids(
        EntityKind::Epic,
        plan.epics.iter().map(|e| e.id.as_str()),
        &mut push,
    );
    let story_ids = unique_ids(
        EntityKind::Story,
        plan.stories.iter().map(|s| s.id.as_str()),
        &mut push,
    );
    unique_ids(
        EntityKind::Sprint,
        plan.sprints.iter().map(|s| s.name.as_str()),
        &mut push,
    );
    unique_ids(
        EntityKind::View,
        plan.views.iter().map(|v| v.name.as_str()),
        &mut push,
    );

    for epic in &plan.epics {
        if epic.title.trim().is_empty() {
            push(Some(epic.key()), "title must not be empty".to_string());
        }
        for story_id in &epic.stories {
            if !story_ids.contains(story_id.as_str()) {
                push(
                    Some(epic.key()),
                    format!("references non-existent story {story_id:?}"),
                );
            }
        }
    }

    let statuses = plan.allowed_statuses();
    for story in &plan.stories {
        if story.summary.trim().is_empty() {
            push(Some(story.key()), "summary must not be empty".to_string());
        }
        if story.story_points < 0 {
            push(
                Some(story.key()),
                format!(
                    "story_points must be a non-negative integer, got {}",
                    story.story_points
                ),
            );
        }
        if !statuses.iter().any(|s| s == &story.status) {
            push(
                Some(story.key()),
                format!(
                    "status {:?} is not one of [{}]",
                    story.status,
                    statuses.join(", ")
                ),
            );
        }
        for label in &story.labels {
            if let Some(prefix) = RESERVED_LABEL_PREFIXES.iter().find(|p| label.starts_with(*p)) {
                push(
                    Some(story.key()),
                    format!("label {label:?} uses the reserved prefix {prefix:?}"),
                );
            }
        }
        if let Some(epic_id) = story.epic_id.as_deref().filter(|id| !id.is_empty()) {
            if !epic_ids.contains(epic_id) {
                push(
                    Some(story.key()),
                    format!("references non-existent epic {epic_id:?}"),
                );
            }
        }
    }

    for sprint in &plan.sprints {
        if sprint.start_date > sprint.end_date {
            push(
                Some(sprint.key()),
                format!(
                    "start_date {} is after end_date {}",
                    sprint.start_date, sprint.end_date
                ),
            );
        }
        for story_id in &sprint.stories {
            if !story_ids.contains(story_id.as_str()) {
                push(
                    Some(sprint.key()),
                    format!("references non-existent story {story_id:?}"),
                );
            }
        }
    }

    for view in &plan.views {
        for (column, assigned) in &view.initial_assignments {
            if !view.columns.contains(column) {
                push(
                    Some(view.key()),
                    format!("initial assignment references non-existent column {column:?}"),
                );
            }
            for story_id in assigned {
                if !story_ids.contains(story_id.as_str()) {
                    push(
                        Some(view.key()),
                        format!(
                            "initial assignment for column {column:?} references non-existent story {story_id:?}"
                        ),
                    );
                }
            }
        }
    }

    issues
}

/// Collect ids of one kind, reporting empties and duplicates.
fn unique_ids<'a>(
    kind: EntityKind,
    ids: impl Iterator<Item = &'a str>,
    push: &mut impl FnMut(Option<EntityKey>, String),
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            push(None, format!("{kind} with an empty id"));
            continue;
        }
        if !seen.insert(id) {
            push(
                Some(EntityKey::new(kind, id)),
                format!("duplicate {kind} id"),
            );
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Plan {
        serde_json::from_str(json).expect("plan parses")
    }

    #[test]
    fn valid_plan_has_no_issues() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": ""},
                "epics": [{"id": "E1", "title": "Auth", "stories": ["S1"]}],
                "stories": [{"id": "S1", "epic_id": "E1", "summary": "Login",
                             "story_points": 3, "status": "Review"}],
                "sprints": [{"name": "Sprint 1", "start_date": "2025-01-06",
                             "end_date": "2025-01-06", "stories": ["S1"]}]
            }"#,
        );
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn collects_every_dangling_reference() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": ""},
                "epics": [{"id": "E1", "title": "Auth", "stories": ["S9"]}],
                "stories": [{"id": "S1", "epic_id": "E2", "summary": "Login",
                             "story_points": 1, "status": "To Do"}],
                "sprints": [{"name": "Sprint 1", "start_date": "2025-01-06",
                             "end_date": "2025-01-10", "stories": ["S1", "S7"]}]
            }"#,
        );
        let issues = validate_plan(&plan);
        let rendered: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
        assert_eq!(issues.len(), 3, "got: {rendered:?}");
        assert!(rendered.contains(&"epic:E1: references non-existent story \"S9\"".to_string()));
        assert!(rendered.contains(&"story:S1: references non-existent epic \"E2\"".to_string()));
        assert!(
            rendered.contains(&"sprint:Sprint 1: references non-existent story \"S7\"".to_string())
        );
    }

    #[test]
    fn rejects_negative_points_unknown_status_and_reversed_dates() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": "",
                            "statuses": ["Open", "Closed"]},
                "stories": [{"id": "S1", "summary": "Login", "story_points": -1,
                             "status": "To Do"}],
                "sprints": [{"name": "Sprint 1", "start_date": "2025-02-01",
                             "end_date": "2025-01-01"}]
            }"#,
        );
        let issues = validate_plan(&plan);
        assert_eq!(issues.len(), 3);
        assert!(issues[0].message.contains("non-negative"));
        assert!(issues[1].message.contains("[Open, Closed]"));
        assert!(issues[2].message.contains("after end_date"));
    }

    #[test]
    fn rejects_duplicate_ids_within_a_kind_only() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": ""},
                "epics": [{"id": "X1", "title": "A"}, {"id": "X1", "title": "B"}],
                "stories": [{"id": "X1", "summary": "Same id, other kind",
                             "story_points": 0, "status": "Done"}]
            }"#,
        );
        let issues = validate_plan(&plan);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].entity, Some(EntityKey::epic("X1")));
    }

    #[test]
    fn rejects_labels_with_tracker_metadata_prefixes() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": ""},
                "stories": [{"id": "S1", "summary": "Login", "story_points": 1,
                             "status": "To Do",
                             "labels": ["frontend", "status:blocked", "pmac:legacy", "epicness"]}]
            }"#,
        );
        let issues = validate_plan(&plan);
        let rendered: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "story:S1: label \"status:blocked\" uses the reserved prefix \"status:\"",
                "story:S1: label \"pmac:legacy\" uses the reserved prefix \"pmac:\"",
            ]
        );
    }

    #[test]
    fn view_assignments_must_name_known_columns_and_stories() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": ""},
                "stories": [{"id": "S1", "summary": "Login", "story_points": 1,
                             "status": "To Do"}],
                "views": [{"type": "board", "name": "Board", "columns": ["To Do", "Done"],
                           "initial_assignments": {"To Do": ["S1", "S4"], "Blocked": ["S1"]}}]
            }"#,
        );
        let issues = validate_plan(&plan);
        let rendered: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
        assert_eq!(issues.len(), 2, "got: {rendered:?}");
        assert!(rendered.contains(
            &"view:Board: initial assignment references non-existent column \"Blocked\"".to_string()
        ));
        assert!(rendered.contains(
            &"view:Board: initial assignment for column \"To Do\" references non-existent story \"S4\""
                .to_string()
        ));
    }

    #[test]
    fn story_without_epic_is_allowed() {
        let plan = parse(
            r#"{
                "project": {"project_key": "PM", "name": "Demo", "description": ""},
                "stories": [{"id": "S1", "epic_id": null, "summary": "Chore",
                             "story_points": 0, "status": "Done"}]
            }"#,
        );
        assert!(validate_plan(&plan).is_empty());
    }
}
