//! Conflict resolution strategies.
//!
//! Resolution is a pure function of the strategy and the conflict, so a
//! fixed strategy over fixed inputs always yields the same change set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::reconcile::{Change, ChangeKind, Conflict, RelinkDirection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The plan wins.
    #[default]
    SourcePriority,
    /// The more recently modified side wins; ties go to the plan.
    NewestWins,
    /// Leave the conflict for a human.
    Manual,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::SourcePriority => "source_priority",
            Strategy::NewestWins => "newest_wins",
            Strategy::Manual => "manual",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "source_priority" => Ok(Strategy::SourcePriority),
            "newest_wins" => Ok(Strategy::NewestWins),
            "manual" => Ok(Strategy::Manual),
            other => Err(format!(
                "unknown strategy {other:?} (expected source_priority, newest_wins, or manual)"
            )),
        }
    }
}

/// Result of applying a strategy to a batch of conflicts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub changes: Vec<Change>,
    /// Conflicts the strategy left open (`ConflictUnresolved`).
    pub unresolved: Vec<Conflict>,
}

/// Resolve one conflict. `None` means it stays unresolved.
pub fn resolve_conflict(strategy: Strategy, conflict: &Conflict) -> Option<Change> {
    match strategy {
        Strategy::SourcePriority => Some(plan_wins(conflict)),
        Strategy::NewestWins => match (conflict.plan_modified_at, conflict.remote_seen_at) {
            (Some(plan_at), Some(remote_at)) if remote_at > plan_at => Some(remote_wins(conflict)),
            _ => Some(plan_wins(conflict)),
        },
        Strategy::Manual => None,
    }
}

/// Resolve every conflict, keeping the input order.
pub fn resolve_all(strategy: Strategy, conflicts: Vec<Conflict>) -> Resolution {
    let mut resolution = Resolution::default();
    for conflict in conflicts {
        match resolve_conflict(strategy, &conflict) {
            Some(change) => {
                tracing::info!(
                    pair = %conflict.pair,
                    strategy = %strategy,
                    outcome = change.kind.label(),
                    "resolved conflict"
                );
                resolution.changes.push(change);
            }
            None => {
                tracing::warn!(pair = %conflict.pair, "conflict left unresolved");
                resolution.unresolved.push(conflict);
            }
        }
    }
    resolution
}

fn plan_wins(conflict: &Conflict) -> Change {
    Change {
        pair: conflict.pair.clone(),
        kind: ChangeKind::Update {
            remote_id: conflict.remote_id.clone(),
        },
        fields: conflict.plan_fields.clone(),
        changed: conflict.plan_fields.diff(&conflict.remote_fields),
        parent: conflict.parent.clone(),
        members: conflict.members.clone(),
        expected_base: Some(conflict.base_hash.clone()),
    }
}

fn remote_wins(conflict: &Conflict) -> Change {
    Change {
        pair: conflict.pair.clone(),
        kind: ChangeKind::Relink {
            remote_id: conflict.remote_id.clone(),
            direction: RelinkDirection::Pull,
            remote_hash: conflict.remote_hash.clone(),
        },
        fields: conflict.remote_fields.clone(),
        changed: conflict.remote_fields.diff(&conflict.plan_fields),
        parent: conflict.parent.clone(),
        members: conflict.members.clone(),
        expected_base: Some(conflict.base_hash.clone()),
    }
}
