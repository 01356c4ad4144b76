//! Single-resource commands: show, refresh, import, delete, drift, list

use anyhow::{Result, bail};
use colored::Colorize;
use declarative::{LiveState, ResourceIdentity};

use crate::Context;
use crate::engine::Engine;
use crate::engine::differ::display_drift;
use crate::ui;

/// Print the recorded state of a resource
pub fn show(_ctx: &Context, engine: &Engine, identity: &ResourceIdentity) -> Result<()> {
    let Some(live) = engine.reconciler.store().get(identity) else {
        bail!("{identity} is not recorded; import it first");
    };
    print_live(engine, &live);
    Ok(())
}

/// Re-read a resource from the remote and record what it reports
pub fn refresh(ctx: &Context, engine: &Engine, identity: &ResourceIdentity) -> Result<()> {
    let live = engine.reconciler.read(identity, &engine.call_context())?;
    if !ctx.quiet {
        ui::success(&format!("Refreshed {identity}"));
    }
    print_live(engine, &live);
    Ok(())
}

/// Start managing a resource that already exists remotely
pub fn import(ctx: &Context, engine: &Engine, identity: &ResourceIdentity) -> Result<()> {
    let live = engine.reconciler.import(identity, &engine.call_context())?;
    if !ctx.quiet {
        ui::success(&format!("Imported {identity}"));
    }
    print_live(engine, &live);
    Ok(())
}

/// Delete a resource remotely and forget it
pub fn delete(ctx: &Context, engine: &Engine, identity: &ResourceIdentity, yes: bool) -> Result<()> {
    // Validates the type before prompting
    engine.schema_of(identity)?;

    if !yes && !confirm_delete(identity)? {
        ui::info("Aborted");
        return Ok(());
    }

    let result = engine.reconciler.delete(identity, &engine.call_context());
    engine.save_remote()?;
    result?;

    if !ctx.quiet {
        ui::success(&format!("Deleted {identity}"));
    }
    Ok(())
}

/// Compare the remote against the recorded state
pub fn drift(_ctx: &Context, engine: &Engine, identity: &ResourceIdentity) -> Result<()> {
    let changes = engine.reconciler.detect_drift(identity, &engine.call_context())?;
    display_drift(&identity.to_string(), &changes);
    Ok(())
}

/// List every recorded resource
pub fn list(ctx: &Context, engine: &Engine) -> Result<()> {
    let store = engine.reconciler.store();
    let identities = store.identities();

    ui::header("Recorded Resources");
    if identities.is_empty() {
        ui::dim("No resources recorded yet");
        return Ok(());
    }

    for identity in &identities {
        let Some(live) = store.get(identity) else {
            continue;
        };
        let phase = engine.reconciler.phase(identity);
        println!(
            "  {} {:<50} {} {}",
            ui::phase_symbol(phase),
            identity.to_string().bold(),
            ui::short_fingerprint(&live.fingerprint).cyan(),
            ui::timestamp(live.observed_at).dimmed()
        );
        if ctx.verbose > 0 {
            ui::dim(&format!("{phase:?}"));
        }
    }
    println!();
    ui::dim(&format!("{} resource(s)", identities.len()));
    Ok(())
}

fn print_live(engine: &Engine, live: &LiveState) {
    ui::header(&live.identity.to_string());
    ui::kv("Phase", &format!("{:?}", engine.reconciler.phase(&live.identity)));
    ui::kv("Fingerprint", &live.fingerprint);
    ui::kv("Observed", &ui::timestamp(live.observed_at));

    ui::section("Attributes");
    for (field, value) in &live.attributes {
        if !value.is_null() {
            ui::kv(field, &ui::value(value));
        }
    }
}

fn confirm_delete(identity: &ResourceIdentity) -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt(format!("Delete {identity}?"))
        .default(false)
        .interact()?;

    Ok(confirmed)
}
