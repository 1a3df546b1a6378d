//! `pmac validate` command: load the plan and list every problem found.

use anyhow::{Result, bail};

use pmac_core::plan::{PlanError, PlanStore};

use crate::config::ResolvedConfig;

/// Run the validate command. Fails when the plan has any issue.
pub fn run_validate(resolved: &ResolvedConfig) -> Result<()> {
    let store = PlanStore::new(&resolved.plan_path);
    if let Some(source) = &resolved.source {
        println!("Config: {}", source.display());
    }
    match store.load() {
        Ok(plan) => {
            println!("Plan: {} ({})", plan.project.name, store.path().display());
            println!(
                "  epics={} stories={} sprints={} views={}",
                plan.epics.len(),
                plan.stories.len(),
                plan.sprints.len(),
                plan.views.len(),
            );
            println!("Plan is valid.");
            Ok(())
        }
        Err(PlanError::Invalid { issues }) => {
            println!("Plan: {}", store.path().display());
            for issue in &issues {
                println!("  [!] {issue}");
            }
            bail!("plan has {} issue(s)", issues.len());
        }
        Err(err) => Err(err.into()),
    }
}
