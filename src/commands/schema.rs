//! `schema` command - describe the registered resource types

use anyhow::Result;
use colored::Colorize;
use declarative::{FieldKind, FieldSpec, NameAssignment, Schema, UpdateRoute};

use crate::Context;
use crate::engine::Engine;
use crate::ui;

pub fn run(ctx: &Context, engine: &Engine, resource_type: Option<&str>) -> Result<()> {
    match resource_type {
        Some(rt) => {
            let schema = engine.schema(rt)?;
            describe(ctx, &schema);
        }
        None => {
            ui::header("Resource Types");
            for rt in engine.reconciler.registry().resource_types() {
                println!("  {}", rt.bold());
            }
        }
    }
    Ok(())
}

fn describe(ctx: &Context, schema: &Schema) {
    ui::header(&schema.resource_type);
    let ids = &schema.identity;
    ui::kv(
        "Identity",
        &format!("{} (name), {} (scope)", ids.name_field, ids.scope_field),
    );
    if ids.assignment == NameAssignment::ServerAssigned {
        ui::kv("Names", "assigned by the remote when omitted");
    }
    if let Some(pattern) = ids.name_pattern {
        ui::kv("Name pattern", pattern);
    }
    ui::kv("Long-running", if schema.long_running { "yes" } else { "no" });

    ui::section("Fields");
    for field in &schema.fields {
        println!("  {:<32} {}", field.name.bold(), kind_label(&field.kind).dimmed());
        let flags = flags(field);
        if !flags.is_empty() {
            println!("    {}", flags.join(", ").cyan());
        }
        if ctx.verbose > 0
            && let FieldKind::Enum(values) = field.kind
        {
            ui::dim(&values.join(" | "));
        }
    }

    if !schema.groups.is_empty() {
        ui::section("Exclusive Groups");
        for group in &schema.groups {
            let mut line = format!("{}: one of {}", group.name, group.members.join(", "));
            if group.required {
                line.push_str(" (required)");
            }
            if let Some((field, value)) = &group.implicit_default {
                line.push_str(&format!(", defaults to {field} = {}", ui::value(value)));
            }
            println!("  {line}");
        }
    }
}

fn kind_label(kind: &FieldKind) -> String {
    match kind {
        FieldKind::String => "string".into(),
        FieldKind::Enum(_) => "enum".into(),
        FieldKind::Integer { min, max } => format!("integer [{min}, {max}]"),
        FieldKind::Bool => "bool".into(),
        FieldKind::Labels => "labels".into(),
        FieldKind::Object(spec) => format!("object ({spec:?})"),
    }
}

fn flags(field: &FieldSpec) -> Vec<String> {
    let mut flags = Vec::new();
    if field.required {
        flags.push("required".to_string());
    }
    if field.immutable {
        flags.push("immutable".to_string());
    }
    if field.output_only {
        flags.push("output only".to_string());
    } else if field.computed {
        flags.push("computed".to_string());
    }
    if let Some(default) = &field.default {
        flags.push(format!("default {}", ui::value(default)));
    }
    match field.update {
        UpdateRoute::Shared => {}
        UpdateRoute::Separate(tag) => flags.push(format!("updated via {tag}")),
        UpdateRoute::LocalOnly => flags.push("local only".to_string()),
    }
    flags
}
