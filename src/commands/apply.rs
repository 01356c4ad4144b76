//! Manifest commands: `plan` and `apply`

use anyhow::{Context as AnyhowContext, Result, bail};
use std::path::Path;

use crate::Context;
use crate::engine::differ::display_plans;
use crate::engine::{Engine, ExecuteOptions, Planned, execute, plan_manifest};
use crate::manifest::Manifest;
use crate::ui;

/// Show the operations a manifest would run, without calling the remote
pub fn plan(ctx: &Context, engine: &Engine, manifest_path: &Path) -> Result<()> {
    let manifest = load(manifest_path)?;
    let planned = plan_manifest(engine, &manifest);
    display_plans(&planned);

    let invalid = planned.iter().filter(|p| p.is_invalid()).count();
    if invalid > 0 {
        bail!("{invalid} resource(s) in the manifest are invalid");
    }
    if !ctx.quiet && !planned.iter().any(Planned::has_changes) {
        println!();
        ui::success("Everything is up to date");
    }
    Ok(())
}

/// Converge every resource in a manifest
pub fn apply(ctx: &Context, engine: &Engine, manifest_path: &Path, opts: &ExecuteOptions) -> Result<()> {
    let manifest = load(manifest_path)?;
    let planned = plan_manifest(engine, &manifest);
    log::info!(
        "Planned {} resource(s) from {} with {} job(s)",
        planned.len(),
        manifest_path.display(),
        opts.jobs
    );

    let summary = execute(engine, &planned, opts)?;
    if ctx.verbose > 0 {
        ui::dim(&format!(
            "{} changed, {} unchanged",
            summary.total_changes(),
            summary.no_change
        ));
    }
    if !summary.is_success() {
        bail!("{} resource(s) failed to converge", summary.failed);
    }
    Ok(())
}

fn load(path: &Path) -> Result<Manifest> {
    Manifest::load(path).with_context(|| format!("Failed to load manifest: {}", path.display()))
}
