//! `pmac sync`, `pmac diff` and `pmac unlink` commands.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use pmac_core::engine::{PassReport, SyncEngine};
use pmac_core::executor::{ChangeReport, Outcome};
use pmac_core::mapping::MappingTable;
use pmac_core::plan::{EntityKey, EntityKind, PlanStore};
use pmac_core::reconcile::{Change, InboundPolicy};
use pmac_core::resolve::Strategy;
use pmac_core::tracker::{TrackerKind, TrackerRegistry};

use crate::config::ResolvedConfig;

/// Command-line overrides for one pass.
#[derive(Debug, Default)]
pub struct SyncArgs {
    pub strategy: Option<Strategy>,
    pub inbound_policy: Option<InboundPolicy>,
    pub dry_run: bool,
}

fn open_mapping(resolved: &ResolvedConfig) -> Result<Arc<MappingTable>> {
    let table = MappingTable::open(&resolved.mapping_path).with_context(|| {
        format!(
            "failed to open mapping file {}",
            resolved.mapping_path.display()
        )
    })?;
    Ok(Arc::new(table))
}

/// Run one sync pass (or a dry run) and print the report.
///
/// Exits with status 1 when any change failed, was deferred or skipped, or
/// a pair could not be read, and with status 2 when only open conflicts
/// remain.
pub async fn run_sync(resolved: &ResolvedConfig, args: SyncArgs) -> Result<()> {
    let registry = Arc::new(resolved.build_registry()?);
    let mapping = open_mapping(resolved)?;

    let mut options = resolved.file.engine_options();
    if let Some(strategy) = args.strategy {
        options.strategy = strategy;
    }
    if let Some(policy) = args.inbound_policy {
        options.inbound_policy = policy;
    }
    options.dry_run = args.dry_run;

    let engine = SyncEngine::new(
        PlanStore::new(&resolved.plan_path),
        mapping,
        registry,
        options,
    );

    // First signal cancels the pass, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    let watcher = tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nFinishing the current change (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let result = engine.run_pass(&cancel).await;
    watcher.abort();
    let report = result?;

    print!("{}", render_report(&report));

    let broken = report.failed() + report.deferred() + report.skipped() + report.failures.len();
    if broken > 0 {
        std::process::exit(1);
    }
    if !report.conflicts.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

/// Remove one pair's mapping entry. The remote record stays as it is.
pub async fn run_unlink(
    resolved: &ResolvedConfig,
    kind: EntityKind,
    id: String,
    tracker: TrackerKind,
) -> Result<()> {
    let mapping = open_mapping(resolved)?;
    let engine = SyncEngine::new(
        PlanStore::new(&resolved.plan_path),
        mapping,
        Arc::new(TrackerRegistry::new()),
        resolved.file.engine_options(),
    );

    let report = engine.unlink(EntityKey::new(kind, id), tracker).await?;
    match &report.outcome {
        Outcome::Applied { remote_id, .. } => {
            println!(
                "Unlinked {} from {tracker} record {remote_id}.",
                report.change.pair.entity
            );
            Ok(())
        }
        other => anyhow::bail!("unlink of {} {}", report.change.pair, describe(other)),
    }
}

// -----------------------------------------------------------------------
// Rendering
// -----------------------------------------------------------------------

/// Render a pass report as plain text.
pub fn render_report(report: &PassReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { " (dry run)" } else { "" };
    let _ = writeln!(out, "Pass {}{mode}", report.pass_id);
    let _ = writeln!(out, "Strategy: {}", report.strategy);
    out.push('\n');

    if report.dry_run {
        if report.planned.is_empty() {
            let _ = writeln!(out, "No changes.");
        } else {
            let _ = writeln!(out, "Planned changes:");
            for change in &report.planned {
                let _ = writeln!(out, "  {}", describe_change(change));
            }
        }
    } else if report.reports.is_empty() {
        let _ = writeln!(out, "No changes.");
    } else {
        let _ = writeln!(out, "Changes:");
        for change_report in &report.reports {
            let _ = writeln!(out, "  {}", describe_report(change_report));
        }
    }

    if !report.merged.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "Merged into plan:");
        for key in &report.merged {
            let _ = writeln!(out, "  - {key}");
        }
    }

    if !report.conflicts.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "Unresolved conflicts:");
        for conflict in &report.conflicts {
            let fields = conflict.plan_fields.diff(&conflict.remote_fields);
            let _ = writeln!(
                out,
                "  [?] {} (remote {}): {}",
                conflict.pair,
                conflict.remote_id,
                fields.join(", ")
            );
        }
    }

    if !report.failures.is_empty() {
        out.push('\n');
        let _ = writeln!(out, "Not reconciled:");
        for failure in &report.failures {
            let _ = writeln!(out, "  [!] {}: {}", failure.pair, failure.error);
        }
    }

    if !report.dry_run {
        out.push('\n');
        let _ = writeln!(
            out,
            "applied={} failed={} deferred={} skipped={} conflicts={}",
            report.applied(),
            report.failed(),
            report.deferred(),
            report.skipped(),
            report.conflicts.len(),
        );
    }
    out
}

fn describe_change(change: &Change) -> String {
    let mut line = format!("{:<7} {}", change.kind.label(), change.pair);
    if !change.changed.is_empty() {
        let _ = write!(line, " [{}]", change.changed.join(", "));
    }
    line
}

fn describe_report(report: &ChangeReport) -> String {
    let icon = match &report.outcome {
        Outcome::Applied { .. } => "+",
        Outcome::Failed { .. } => "!",
        Outcome::Deferred { .. } => "~",
        Outcome::Skipped { .. } => "-",
    };
    format!(
        "[{icon}] {} {}",
        describe_change(&report.change),
        describe(&report.outcome)
    )
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Applied {
            remote_id,
            attempts,
        } => {
            if *attempts > 1 {
                format!("-> {remote_id} after {attempts} attempts")
            } else {
                format!("-> {remote_id}")
            }
        }
        Outcome::Failed { attempts, error } => {
            format!("failed after {attempts} attempt(s): {error}")
        }
        Outcome::Deferred { resume_at } => {
            format!(
                "deferred until {}",
                resume_at.format("%Y-%m-%d %H:%M:%S UTC")
            )
        }
        Outcome::Skipped { reason } => format!("skipped: {reason}"),
    }
}
