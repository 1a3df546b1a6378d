//! `pmac status` command: per-pair sync state from the mapping table.

use std::sync::Arc;

use anyhow::{Context, Result};

use pmac_core::engine::{PairState, StatusReport, SyncEngine};
use pmac_core::mapping::MappingTable;
use pmac_core::plan::PlanStore;
use pmac_core::tracker::TrackerRegistry;

use crate::config::ResolvedConfig;

/// Run the status command. Makes no remote calls and needs no credentials.
pub fn run_status(resolved: &ResolvedConfig) -> Result<()> {
    let mapping = MappingTable::open(&resolved.mapping_path).with_context(|| {
        format!(
            "failed to open mapping file {}",
            resolved.mapping_path.display()
        )
    })?;
    let engine = SyncEngine::new(
        PlanStore::new(&resolved.plan_path),
        Arc::new(mapping),
        Arc::new(TrackerRegistry::new()),
        resolved.file.engine_options(),
    );
    let report = engine.status()?;
    print!("{}", render_status(&report));
    Ok(())
}

pub fn render_status(report: &StatusReport) -> String {
    let mut lines = Vec::new();
    let count = |state: PairState| report.pairs.iter().filter(|p| p.state == state).count();
    lines.push(format!(
        "Pairs: {} in sync, {} with local changes, {} unlinked",
        count(PairState::InSync),
        count(PairState::LocalChanges),
        count(PairState::Unlinked),
    ));
    lines.push(String::new());

    for status in &report.pairs {
        let (icon, state) = match status.state {
            PairState::InSync => ("+", "in sync"),
            PairState::LocalChanges => ("*", "local changes"),
            PairState::Unlinked => (".", "unlinked"),
        };
        let mut line = format!("  [{icon}] {:<28} {state}", status.pair.to_string());
        if let Some(remote_id) = &status.remote_id {
            line.push_str(&format!(" (remote {remote_id}"));
            if let Some(at) = status.last_synced_at {
                line.push_str(&format!(", synced {}", at.format("%Y-%m-%d %H:%M:%S UTC")));
            }
            line.push(')');
        }
        lines.push(line);
    }

    if !report.orphaned.is_empty() {
        lines.push(String::new());
        lines.push("Orphaned mapping entries (entity no longer in plan):".to_string());
        for (pair, entry) in &report.orphaned {
            lines.push(format!("  [X] {pair} (remote {})", entry.remote_id));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};

    use pmac_core::engine::PairStatus;
    use pmac_core::hash::FieldSet;
    use pmac_core::mapping::{MappingEntry, PairKey};
    use pmac_core::plan::EntityKey;
    use pmac_core::tracker::TrackerKind;

    #[test]
    fn renders_states_and_orphans() {
        let synced = Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap();
        let report = StatusReport {
            pairs: vec![
                PairStatus {
                    pair: PairKey::new(EntityKey::epic("E1"), TrackerKind::GitHub),
                    state: PairState::InSync,
                    remote_id: Some("1".to_string()),
                    last_synced_at: Some(synced),
                },
                PairStatus {
                    pair: PairKey::new(EntityKey::story("S1"), TrackerKind::Jira),
                    state: PairState::Unlinked,
                    remote_id: None,
                    last_synced_at: None,
                },
            ],
            orphaned: vec![(
                PairKey::new(EntityKey::story("S9"), TrackerKind::GitHub),
                MappingEntry {
                    remote_id: "42".to_string(),
                    base_hash: FieldSet::new("Gone").digest(),
                    last_synced_at: synced,
                },
            )],
        };

        let text = render_status(&report);
        assert!(text.starts_with("Pairs: 1 in sync, 0 with local changes, 1 unlinked\n"));
        assert!(text.contains("in sync (remote 1, synced 2025-06-02 09:30:00 UTC)"), "{text}");
        assert!(text.contains("[.] story:S1@jira"), "{text}");
        assert!(text.contains("[X] story:S9@github (remote 42)"), "{text}");
    }
}
