//! `validate`, `show` and `output`

use anyhow::{Result, bail};
use colored::Colorize;
use reconcile::{ProviderRegistry, REDACTED, StateSnapshot, StateStore, Value};

use super::{Outcome, Workspace, load_config, open_store};
use crate::Context;
use crate::cli::VarArgs;
use crate::display;
use crate::ui;

/// Load, resolve and build the graph without touching state
pub fn validate(ctx: &Context, args: &VarArgs) -> Result<Outcome> {
    let ws = Workspace::load(ctx, args)?;
    let graph = ws.graph()?;

    let providers = ProviderRegistry::with_builtins();
    let mut unknown: Vec<&str> = graph
        .nodes()
        .filter(|n| !providers.supports(&n.node_type))
        .map(|n| n.id.as_str())
        .collect();
    unknown.sort_unstable();
    for id in &unknown {
        ui::warn(&format!("{id}: no provider for this type; apply will fail it"));
    }

    if !ctx.quiet {
        ui::success(&format!(
            "Configuration is valid: {}, {}, {}",
            ui::count(graph.len(), "node"),
            ui::count(graph.edge_count(), "dependency"),
            ui::count(ws.vars.len(), "variable")
        ));
        if ctx.verbose > 0 {
            for (name, var) in ws.vars.iter() {
                let value = ws.vars.display(name).unwrap_or_default();
                ui::kv(name, &format!("{value} {}", format!("({})", var.source).dimmed()));
            }
        }
    }
    Ok(Outcome::Success)
}

/// Copy of the state with sensitive attributes, hooks and outputs replaced
fn redacted(mut snapshot: StateSnapshot) -> StateSnapshot {
    for record in snapshot.records.values_mut() {
        for name in &record.sensitive_attributes {
            for values in [&mut record.attributes, &mut record.inputs] {
                if let Some(value) = values.get_mut(name) {
                    *value = Value::from(REDACTED);
                }
            }
        }
        for hook in &mut record.destroy_hooks {
            *hook = hook.redacted();
        }
    }
    for output in snapshot.outputs.values_mut() {
        if output.sensitive {
            output.value = Value::from(REDACTED);
        }
    }
    snapshot
}

/// List what the state file records
pub fn show(ctx: &Context, json: bool) -> Result<Outcome> {
    let config = load_config(ctx)?;
    let store = open_store(&config)?;
    let snapshot = redacted(store.snapshot()?);

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(Outcome::Success);
    }

    if snapshot.is_empty() {
        ui::info("State is empty");
        return Ok(Outcome::Success);
    }

    ui::header(&format!(
        "State: {} (serial {})",
        ui::count(snapshot.records.len(), "node"),
        snapshot.serial
    ));
    for record in snapshot.records.values() {
        ui::section(&record.id);
        ui::kv("type", &record.node_type);
        ui::kv("applied", &record.applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        if !record.dependencies.is_empty() {
            let deps: Vec<&str> = record.dependencies.iter().map(String::as_str).collect();
            ui::kv("depends on", &deps.join(", "));
        }
        for (name, value) in &record.attributes {
            ui::kv(name, &ui::truncate(&value.to_string(), 80));
        }
        for (name, value) in &record.outputs {
            ui::kv(name, &ui::truncate(&value.to_string(), 80).cyan().to_string());
        }
    }
    display::show_outputs(&snapshot.outputs);
    Ok(Outcome::Success)
}

/// Print root outputs, or one output's raw value
pub fn output(ctx: &Context, name: Option<&str>, json: bool) -> Result<Outcome> {
    let config = load_config(ctx)?;
    let store = open_store(&config)?;
    let snapshot = store.snapshot()?;

    if let Some(name) = name {
        let Some(output) = snapshot.outputs.get(name) else {
            bail!("Output `{name}` not found; apply the configuration first");
        };
        if json {
            println!("{}", serde_json::to_string(&output.value)?);
        } else {
            println!("{}", display::output_value(output, true));
        }
        return Ok(Outcome::Success);
    }

    let snapshot = redacted(snapshot);
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.outputs)?);
    } else if snapshot.outputs.is_empty() {
        ui::info("No outputs recorded");
    } else {
        for (name, output) in &snapshot.outputs {
            println!("{name} = {}", output.value);
        }
    }
    Ok(Outcome::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_context;
    use reconcile::{
        Hook, HookAction, HookWhen, LocalStateStore, Node, OnFailure, OutputValue, StateRecord,
    };
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_redacted_hides_sensitive_values() {
        let mut node = Node::resource("null_resource", "db")
            .with_attr("user", "admin")
            .with_attr("password", "hunter2");
        node.sensitive_attributes = BTreeSet::from(["password".to_string()]);

        let mut snapshot = StateSnapshot::default();
        snapshot.records.insert(
            node.id.clone(),
            StateRecord::from_node(&node, BTreeSet::new(), Default::default()),
        );
        snapshot.outputs.insert(
            "password".to_string(),
            OutputValue {
                value: Value::from("hunter2"),
                sensitive: true,
            },
        );

        let text = serde_json::to_string(&redacted(snapshot)).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("admin"));
    }

    #[test]
    fn test_redacted_hides_sensitive_destroy_hooks() {
        let cleanup = |command: &str, sensitive: bool| Hook {
            action: HookAction::LocalExec {
                command: command.to_string(),
                working_dir: None,
                environment: Default::default(),
                interpreter: Vec::new(),
            },
            when: HookWhen::Destroy,
            on_failure: OnFailure::Fail,
            sensitive,
        };
        let mut node = Node::resource("null_resource", "db");
        node.hooks.push(cleanup("cleanup --password hunter2", true));
        node.hooks.push(cleanup("echo done", false));

        let mut snapshot = StateSnapshot::default();
        snapshot.records.insert(
            node.id.clone(),
            StateRecord::from_node(&node, BTreeSet::new(), Default::default()),
        );

        let text = serde_json::to_string(&redacted(snapshot)).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("echo done"));
        assert!(text.contains(REDACTED));
    }

    #[test]
    fn test_validate_reports_cycles() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.lf.toml"),
            r#"
[[resource]]
type = "null_resource"
name = "a"
attributes = { x = "${null_resource.b.id}" }

[[resource]]
type = "null_resource"
name = "b"
attributes = { x = "${null_resource.a.id}" }
"#,
        )
        .unwrap();
        let err = validate(&test_context(dir.path()), &VarArgs::default()).unwrap_err();
        assert!(format!("{err:#}").contains("null_resource.a"));
        // Validation never creates state
        assert!(!dir.path().join("landform.state.json").exists());
    }

    #[test]
    fn test_output_missing_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.lf.toml"), "").unwrap();
        let store = LocalStateStore::open(dir.path().join("landform.state.json")).unwrap();
        store.set_outputs(Default::default()).unwrap();

        let err = output(&test_context(dir.path()), Some("nope"), false).unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(
            output(&test_context(dir.path()), None, true).unwrap(),
            Outcome::Success
        );
    }
}
