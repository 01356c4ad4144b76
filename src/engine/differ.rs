//! Plan display - converge-specific UI

use super::Planned;
use crate::ui;
use colored::Colorize;
use declarative::{
    ChangeOperation, DiffSummary, FieldChange, LiveState, OperationKind, Plan, Schema,
    field_changes,
};
use serde_json::Value;
use std::fmt::Write as _;

/// Count operations across every valid plan
pub fn summarize(planned: &[Planned]) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for op in planned
        .iter()
        .filter_map(|p| p.plan.as_ref().ok())
        .flat_map(|p| &p.operations)
    {
        summary.add(op);
    }
    summary
}

/// Display every planned resource in a user-friendly format
pub fn display_plans(planned: &[Planned]) {
    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Reconciliation Plan".bold()
    );
    println!("│");

    for p in planned {
        match (&p.plan, &p.schema) {
            (Ok(plan), Some(schema)) => display_plan(&p.label, schema, plan),
            (Err(e), _) => {
                println!("│ {} {}", "✗".red(), p.label.bold());
                println!("│     {}", e.to_string().red());
            }
            (Ok(_), None) => {}
        }
    }

    let summary = summarize(planned);
    let invalid = planned.iter().filter(|p| p.is_invalid()).count();
    println!("│");
    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} to create, {} to update, {} local-only, {} invalid",
        summary.creates.to_string().green(),
        summary.updates.to_string().yellow(),
        summary.local_only.to_string().dimmed(),
        invalid.to_string().red()
    );
    println!("└─────────────────────────────────────────────────────┘");
}

fn display_plan(label: &str, schema: &Schema, plan: &Plan) {
    let symbol = match plan.operations.first().map(|op| op.kind) {
        None => "○".dimmed(),
        Some(OperationKind::Create) => "+".green(),
        Some(OperationKind::Delete) => "-".red(),
        Some(_) => "~".yellow(),
    };
    let note = match &plan.live {
        _ if plan.is_empty() => "(up to date)".to_string(),
        None => "(new)".to_string(),
        Some(_) => format!("({} operation(s))", plan.operations.len()),
    };
    println!("│ {} {:<45} {}", symbol, label.bold(), note.dimmed());

    if plan.is_empty() {
        return;
    }

    match &plan.live {
        None => {
            for (field, value) in &plan.desired {
                if schema.field(field).is_some_and(|f| f.is_local_only()) {
                    continue;
                }
                println!("│     {} {} = {}", "+".green(), field, ui::value(value));
            }
        }
        Some(live) => {
            for op in &plan.operations {
                print!("{}", render_operation(schema, op, &plan.desired, live));
            }
        }
    }
}

/// One operation with the fields it changes
pub fn render_operation(
    schema: &Schema,
    op: &ChangeOperation,
    desired: &declarative::CanonicalConfig,
    live: &LiveState,
) -> String {
    let header = match op.kind {
        OperationKind::Noop => "local only".dimmed(),
        OperationKind::Update if op.requires_polling => "update (long-running)".yellow(),
        kind => kind.to_string().to_lowercase().yellow(),
    };
    let mut out = format!("│     {header}\n");
    for change in field_changes(schema, desired, live)
        .into_iter()
        .filter(|c| op.fields.contains(&c.field))
    {
        out.push_str(&render_change(&change));
    }
    out
}

/// A single field change; nested values get a line diff
pub fn render_change(change: &FieldChange) -> String {
    let nested = |v: &Option<Value>| matches!(v, Some(Value::Object(_) | Value::Array(_)));
    if !nested(&change.before) && !nested(&change.after) {
        let show = |v: &Option<Value>| v.as_ref().map_or("(unset)".to_string(), ui::value);
        return format!(
            "│       {} {}: {} → {}\n",
            "~".yellow(),
            change.field,
            show(&change.before).red(),
            show(&change.after).green()
        );
    }

    let pretty = |v: &Option<Value>| {
        v.as_ref()
            .and_then(|v| serde_json::to_string_pretty(v).ok())
            .map(|s| s + "\n")
            .unwrap_or_default()
    };
    let before = pretty(&change.before);
    let after = pretty(&change.after);

    let mut out = format!("│       {} {}:\n", "~".yellow(), change.field);
    let diff = similar::TextDiff::from_lines(&before, &after);
    for line in diff.iter_all_changes() {
        let _ = match line.tag() {
            similar::ChangeTag::Delete => write!(out, "│         {}", format!("- {line}").red()),
            similar::ChangeTag::Insert => write!(out, "│         {}", format!("+ {line}").green()),
            similar::ChangeTag::Equal => write!(out, "│         {}", format!("  {line}").dimmed()),
        };
    }
    out
}

/// Drift report for one resource
pub fn display_drift(label: &str, drift: &[FieldChange]) {
    if drift.is_empty() {
        ui::success(&format!("{label} matches its recorded state"));
        return;
    }
    ui::warn(&format!("{label} has drifted in {} field(s)", drift.len()));
    for change in drift {
        print!("{}", render_change(change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_change_single_line() {
        colored::control::set_override(false);
        let out = render_change(&FieldChange {
            field: "num_nodes".into(),
            before: Some(json!(1)),
            after: Some(json!(2)),
        });
        assert_eq!(out, "│       ~ num_nodes: 1 → 2\n");
    }

    #[test]
    fn test_nested_change_line_diff() {
        colored::control::set_override(false);
        let out = render_change(&FieldChange {
            field: "autoscaling_config".into(),
            before: None,
            after: Some(json!({"autoscaling_limits": {"min_nodes": 1}})),
        });
        assert!(out.contains("\"min_nodes\": 1"), "{out}");
        assert!(out.lines().skip(1).all(|l| l.trim_start_matches(['│', ' ']).starts_with('+')), "{out}");
    }

    #[test]
    fn test_unset_scalar() {
        colored::control::set_override(false);
        let out = render_change(&FieldChange {
            field: "edition".into(),
            before: Some(json!("STANDARD")),
            after: None,
        });
        assert!(out.contains("STANDARD → (unset)"), "{out}");
    }
}
