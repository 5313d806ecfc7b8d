//! Plan, apply and output rendering

use crate::ui;
use colored::{ColoredString, Colorize};
use reconcile::{
    Action, ApplyReport, AttributeChange, Change, ChangeSet, OutputValue, PlanMode, PlanSummary,
    REDACTED, ReplaceOrder,
};

/// Longest attribute value shown inline
const MAX_VALUE_CHARS: usize = 60;

fn colored_symbol(action: Action) -> ColoredString {
    let symbol = action.symbol();
    match action {
        Action::Create => symbol.green(),
        Action::Update => symbol.yellow(),
        Action::Replace(_) => symbol.magenta(),
        Action::Delete => symbol.red(),
        Action::Read => symbol.cyan(),
        Action::NoOp => symbol.dimmed(),
    }
}

fn attribute_line(change: &AttributeChange, width: usize) -> String {
    let before = ui::truncate(&change.before_display(), MAX_VALUE_CHARS);
    let after = ui::truncate(&change.after_display(), MAX_VALUE_CHARS);
    let (symbol, text) = if change.is_addition() {
        ("+".green(), format!("= {after}"))
    } else if change.is_removal() {
        ("-".red(), format!("= {before}"))
    } else {
        ("~".yellow(), format!("{before} → {after}"))
    };
    let forces = if change.forces_replacement {
        format!(" {}", "# forces replacement".magenta())
    } else {
        String::new()
    };
    format!(
        "│       {} {:<width$} {}{}",
        symbol, change.name, text, forces
    )
}

fn change_lines(change: &Change) -> Vec<String> {
    let mut lines = Vec::new();
    let mut note = change.action.to_string();
    if matches!(change.action, Action::Replace(_)) && !change.replace_reasons.is_empty() {
        note.push_str(&format!(", forced by {}", change.replace_reasons.join(", ")));
    }
    if !change.recomputed.is_empty() {
        note.push_str(&format!(", {} known after apply", change.recomputed.join(", ")));
    }
    lines.push(format!(
        "│   {} {:<40} {}",
        colored_symbol(change.action),
        change.node_id,
        format!("({note})").dimmed()
    ));

    // Deletes only list the address
    if change.action == Action::Delete {
        return lines;
    }
    let attributes = change.attribute_changes();
    let width = attributes.iter().map(|a| a.name.len()).max().unwrap_or(0);
    lines.extend(attributes.iter().map(|a| attribute_line(a, width)));
    lines
}

/// One-line plan summary
pub fn summary_line(summary: PlanSummary) -> String {
    let mut line = format!(
        "Plan: {} to add, {} to change, {} to destroy.",
        summary.add, summary.change, summary.destroy
    );
    if summary.read > 0 {
        line.push_str(&format!(" {} to read.", summary.read));
    }
    line
}

/// Lines of the boxed plan view; empty when nothing changes
pub fn plan_lines(changes: &ChangeSet, verbose: bool) -> Vec<String> {
    if !changes.has_changes() {
        return Vec::new();
    }
    let title = match changes.mode {
        PlanMode::Normal => "Execution Plan",
        PlanMode::Destroy => "Destroy Plan",
    };
    let mut lines = vec![
        format!(
            "┌─ {} ─────────────────────────────────────────┐",
            title.bold()
        ),
        "│".to_string(),
    ];
    let mut unchanged = 0;
    for change in &changes.changes {
        if change.action == Action::NoOp {
            unchanged += 1;
            if verbose {
                lines.push(format!(
                    "│   {} {}",
                    colored_symbol(Action::NoOp),
                    change.node_id.dimmed()
                ));
            }
            continue;
        }
        lines.extend(change_lines(change));
    }
    lines.push("│".to_string());
    lines.push("├─────────────────────────────────────────────────────┤".to_string());
    lines.push(format!("│ {}", summary_line(changes.summary()).bold()));
    if unchanged > 0 {
        lines.push(format!(
            "│ {}",
            format!("{} unchanged", ui::count(unchanged, "node")).dimmed()
        ));
    }
    lines.push("└─────────────────────────────────────────────────────┘".to_string());
    lines
}

/// Print the plan
pub fn show_plan(changes: &ChangeSet, verbose: bool) {
    let lines = plan_lines(changes, verbose);
    println!();
    if lines.is_empty() {
        println!(
            "  {} No changes. Infrastructure matches the configuration.",
            "✓".green()
        );
        return;
    }
    for line in lines {
        println!("{line}");
    }
    if changes.changes.iter().any(|c| {
        c.action == Action::Replace(ReplaceOrder::DestroyBeforeCreate)
    }) {
        ui::dim("-/+ destroys the old object before creating its replacement");
    }
}

fn redacted_json(value: Option<&reconcile::Value>, sensitive: bool) -> serde_json::Value {
    match value {
        Some(_) if sensitive => serde_json::json!(REDACTED),
        other => serde_json::json!(other),
    }
}

fn attribute_json(change: &AttributeChange) -> serde_json::Value {
    serde_json::json!({
        "name": change.name,
        "before": redacted_json(change.before.as_ref(), change.sensitive),
        "after": redacted_json(change.after.as_ref(), change.sensitive),
        "forces_replacement": change.forces_replacement,
    })
}

/// Plan as JSON for scripting
pub fn plan_json(changes: &ChangeSet) -> serde_json::Value {
    let summary = changes.summary();
    let items: Vec<serde_json::Value> = changes
        .changes
        .iter()
        .map(|c| {
            serde_json::json!({
                "address": c.node_id,
                "type": c.node_type,
                "action": c.action.to_string(),
                "replace_reasons": c.replace_reasons,
                "recomputed": c.recomputed,
                "attributes": c
                    .attribute_changes()
                    .iter()
                    .map(attribute_json)
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::json!({
        "changes": items,
        "summary": {
            "add": summary.add,
            "change": summary.change,
            "destroy": summary.destroy,
            "read": summary.read,
        },
    })
}

/// Print the result of an apply
pub fn show_report(report: &ApplyReport) {
    let summary = report.summary();
    println!();
    if report.is_success() {
        println!("  {} Apply complete!", "✓".green().bold());
    } else {
        println!("  {} Apply finished with errors", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} created", ui::count(summary.created, "node"));
    }
    if summary.modified > 0 {
        println!("    • {} updated", ui::count(summary.modified, "node"));
    }
    if summary.replaced > 0 {
        println!("    • {} replaced", ui::count(summary.replaced, "node"));
    }
    if summary.removed > 0 {
        println!("    • {} destroyed", ui::count(summary.removed, "node"));
    }
    if summary.read > 0 {
        println!("    • {} read", ui::count(summary.read, "data source"));
    }
    if summary.skipped > 0 {
        println!(
            "    • {} skipped (a dependency failed)",
            ui::count(summary.skipped, "node")
        );
    }
    if summary.cancelled > 0 {
        println!(
            "    • {} not started (interrupted)",
            ui::count(summary.cancelled, "node")
        );
    }
    if summary.failed > 0 {
        println!(
            "    • {} {}",
            ui::count(summary.failed, "node"),
            "failed".red()
        );
        for (id, error) in report.failures() {
            println!("      {} {}: {}", "✗".red(), id, error);
        }
    }
}

/// Display text of an output value
pub fn output_value(output: &OutputValue, reveal: bool) -> String {
    if output.sensitive && !reveal {
        REDACTED.to_string()
    } else {
        output.value.to_template_string()
    }
}

/// Print root outputs as `name = value`
pub fn show_outputs<'a>(outputs: impl IntoIterator<Item = (&'a String, &'a OutputValue)>) {
    let outputs: Vec<_> = outputs.into_iter().collect();
    if outputs.is_empty() {
        return;
    }
    ui::section("Outputs");
    for (name, output) in outputs {
        let value = if output.sensitive {
            REDACTED.dimmed().to_string()
        } else {
            output.value.to_string()
        };
        println!("  {} = {}", name.bold(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{
        Graph, MemoryStateStore, Node, PlanOptions, StateRecord, StateSnapshot, StateStore, Value,
    };
    use std::collections::BTreeSet;

    fn plain() {
        colored::control::set_override(false);
    }

    fn graph(nodes: Vec<Node>) -> Graph {
        reconcile::build(nodes).unwrap()
    }

    #[test]
    fn test_no_changes_renders_nothing() {
        plain();
        let changes = ChangeSet::default();
        assert!(plan_lines(&changes, false).is_empty());
    }

    #[test]
    fn test_create_lists_attributes_and_summary() {
        plain();
        let node = Node::resource("local_file", "motd").with_attr("content", "hello");
        let changes = reconcile::plan(
            &graph(vec![node]),
            &StateSnapshot::default(),
            &PlanOptions::default(),
        )
        .unwrap();
        let text = plan_lines(&changes, false).join("\n");
        assert!(text.contains("+ local_file.motd"));
        assert!(text.contains("content = \"hello\""));
        assert!(text.contains("Plan: 1 to add, 0 to change, 0 to destroy."));
    }

    #[test]
    fn test_sensitive_values_are_redacted() {
        plain();
        let mut node = Node::resource("null_resource", "db").with_attr("password", "hunter2");
        node.sensitive_attributes.insert("password".to_string());
        let changes = reconcile::plan(
            &graph(vec![node]),
            &StateSnapshot::default(),
            &PlanOptions::default(),
        )
        .unwrap();
        let text = plan_lines(&changes, false).join("\n");
        assert!(!text.contains("hunter2"));
        assert!(text.contains(REDACTED));

        let json = plan_json(&changes).to_string();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_replace_marks_forcing_attribute() {
        plain();
        let old = Node::resource("local_file", "f").with_attr("filename", "/tmp/a");
        let store = MemoryStateStore::new();
        store
            .put(StateRecord::from_node(&old, BTreeSet::new(), Default::default()))
            .unwrap();
        let new = old.clone().with_attr("filename", "/tmp/b");
        let changes = reconcile::plan(
            &graph(vec![new]),
            &store.snapshot().unwrap(),
            &PlanOptions {
                policy: reconcile::ReplacePolicy::builtin(),
                ..Default::default()
            },
        )
        .unwrap();
        let text = plan_lines(&changes, false).join("\n");
        assert!(text.contains("forced by filename"));
        assert!(text.contains("# forces replacement"));
        assert!(text.contains("1 to add, 0 to change, 1 to destroy"));
    }

    #[test]
    fn test_dependent_update_notes_recomputed_attribute() {
        plain();
        let old = Node::resource("local_file", "a").with_attr("content", "one");
        let link = Node::resource("local_file", "b").with_attr("content", "${local_file.a.id}");
        let store = MemoryStateStore::new();
        for node in [&old, &link] {
            store
                .put(StateRecord::from_node(node, BTreeSet::new(), Default::default()))
                .unwrap();
        }
        let changes = reconcile::plan(
            &graph(vec![old.with_attr("content", "two"), link]),
            &store.snapshot().unwrap(),
            &PlanOptions::default(),
        )
        .unwrap();
        let text = plan_lines(&changes, false).join("\n");
        assert!(text.contains("content known after apply"));
        assert!(text.contains("0 to add, 2 to change, 0 to destroy"));
    }

    #[test]
    fn test_summary_line_mentions_reads() {
        let line = summary_line(PlanSummary {
            add: 1,
            change: 0,
            destroy: 0,
            read: 2,
        });
        assert_eq!(
            line,
            "Plan: 1 to add, 0 to change, 0 to destroy. 2 to read."
        );
    }

    #[test]
    fn test_output_value_redaction() {
        let output = OutputValue {
            value: Value::from("secret"),
            sensitive: true,
        };
        assert_eq!(output_value(&output, false), REDACTED);
        assert_eq!(output_value(&output, true), "secret");
    }
}
