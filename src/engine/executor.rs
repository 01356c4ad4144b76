//! Execution engine - parallel apply with UI integration

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::sync::Mutex;

use super::differ::display_plans;
use super::{Engine, Planned};
use declarative::{Applied, OperationKind, ResourceIdentity};

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just show what would happen
    pub dry_run: bool,
    /// Number of parallel jobs
    pub jobs: usize,
    /// Skip confirmation prompts
    pub yes: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            yes: false,
        }
    }
}

/// Result of applying one resource
#[derive(Debug)]
pub enum ApplyResult {
    Created {
        identity: ResourceIdentity,
        server_named: bool,
    },
    Updated,
    NoChange,
    Failed { error: String },
}

/// Summary of execution results
#[derive(Debug, Default)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub no_change: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ExecuteSummary {
    pub fn total_changes(&self) -> usize {
        self.created + self.updated
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Apply a planned manifest
pub fn execute(engine: &Engine, planned: &[Planned], opts: &ExecuteOptions) -> Result<ExecuteSummary> {
    display_plans(planned);

    let invalid = planned.iter().filter(|p| p.is_invalid()).count();
    let pending: Vec<&Planned> = planned.iter().filter(|p| p.has_changes()).collect();
    let mut summary = ExecuteSummary {
        no_change: planned.len() - pending.len() - invalid,
        failed: invalid,
        ..Default::default()
    };

    if pending.is_empty() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return Ok(summary);
    }

    if opts.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        summary.skipped = pending.len();
        return Ok(summary);
    }

    if !opts.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        summary.skipped = pending.len();
        return Ok(summary);
    }

    println!();
    println!("  {} Applying {} resources...", "→".cyan(), pending.len());
    let results = execute_parallel(engine, &pending, opts.jobs)?;
    engine.save_remote()?;

    for (label, result) in &results {
        match result {
            ApplyResult::Created { .. } => summary.created += 1,
            ApplyResult::Updated => summary.updated += 1,
            ApplyResult::NoChange => summary.no_change += 1,
            ApplyResult::Failed { .. } => summary.failed += 1,
        }
        report(label, result);
    }
    print_summary(&summary);

    Ok(summary)
}

/// Apply resources in parallel; each resource is reconciled on its own
fn execute_parallel(engine: &Engine, pending: &[&Planned], jobs: usize) -> Result<Vec<(String, ApplyResult)>> {
    let pb = ProgressBar::new(pending.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("=>-"));
    }
    let results: Mutex<Vec<(usize, String, ApplyResult)>> = Mutex::new(Vec::new());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .context("Failed to create apply thread pool")?;

    pool.install(|| {
        pending.par_iter().enumerate().for_each(|(index, planned)| {
            let result = apply_one(engine, planned);
            let symbol = match &result {
                ApplyResult::NoChange => "○",
                ApplyResult::Created { .. } | ApplyResult::Updated => "✓",
                ApplyResult::Failed { .. } => "✗",
            };
            pb.set_message(format!("{} {}", symbol, planned.label));
            pb.inc(1);

            results
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((index, planned.label.clone(), result));
        });
    });
    pb.finish_and_clear();

    let mut results = results
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    results.sort_by_key(|(index, _, _)| *index);
    Ok(results
        .into_iter()
        .map(|(_, label, result)| (label, result))
        .collect())
}

fn apply_one(engine: &Engine, planned: &Planned) -> ApplyResult {
    let (Some(schema), Ok(plan)) = (&planned.schema, &planned.plan) else {
        return ApplyResult::Failed {
            error: "resource has no valid plan".into(),
        };
    };

    match engine
        .reconciler
        .apply_at(&planned.address, schema, &planned.raw, &engine.call_context())
    {
        Ok(applied) => classify(&applied, plan.target.name.is_none()),
        Err(e) => ApplyResult::Failed {
            error: e.to_string(),
        },
    }
}

fn classify(applied: &Applied, server_named: bool) -> ApplyResult {
    match applied.operations.first().map(|op| op.kind) {
        None => ApplyResult::NoChange,
        Some(OperationKind::Create) => ApplyResult::Created {
            identity: applied.identity.clone(),
            server_named,
        },
        Some(_) => ApplyResult::Updated,
    }
}

fn report(label: &str, result: &ApplyResult) {
    match result {
        ApplyResult::Created {
            identity,
            server_named,
        } => {
            println!("    {} {} created", "✓".green(), identity);
            if *server_named {
                println!("      {}", name_hint(identity).dimmed());
            }
        }
        ApplyResult::Updated => println!("    {} {} updated", "✓".green(), label),
        ApplyResult::NoChange => println!("    {} {} unchanged", "○".dimmed(), label),
        ApplyResult::Failed { error } => {
            println!("    {} {} - {}", "✗".red(), label, error.dimmed());
        }
    }
}

/// Note for resources the remote named; the full name is needed to manage
/// them outside this manifest.
fn name_hint(identity: &ResourceIdentity) -> String {
    format!(
        "server assigned name = \"{}\"; tracked under this manifest entry",
        identity.name
    )
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}

/// Print final summary
fn print_summary(summary: &ExecuteSummary) {
    println!();
    if summary.is_success() {
        println!("  {} Resources converged", "✓".green().bold());
    } else {
        println!("  {} Converged with errors", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} resources created", summary.created);
    }
    if summary.updated > 0 {
        println!("    • {} resources updated", summary.updated);
    }
    if summary.skipped > 0 {
        println!("    • {} resources skipped", summary.skipped);
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "resources".red());
    }
}
