//! `plan`, `apply` and `destroy`

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use reconcile::{
    ChangeSet, CommandHookRunner, ExecuteOptions, PlanMode, PlanOptions, ProviderRegistry,
    StateStore, acquire_lock,
};
use std::time::Duration;

use super::{Outcome, Workspace};
use crate::Context;
use crate::cli::{ApplyArgs, PlanArgs};
use crate::display;
use crate::progress::ApplyProgress;
use crate::signal;
use crate::ui;

fn plan_options(ws: &Workspace, mode: PlanMode, targets: Vec<String>) -> PlanOptions {
    PlanOptions {
        mode,
        targets,
        policy: ws.config.policy.clone(),
    }
}

fn make_plan(ws: &Workspace, store: &dyn StateStore, options: &PlanOptions) -> Result<ChangeSet> {
    let graph = ws.graph()?;
    let prior = store.snapshot().context("Failed to read state")?;
    let changes = reconcile::plan(&graph, &prior, options)?;
    Ok(changes)
}

/// Show what apply (or destroy) would do; never writes state
pub fn plan(ctx: &Context, args: PlanArgs) -> Result<Outcome> {
    let ws = Workspace::load(ctx, &args.vars)?;
    let store = ws.open_store()?;
    let _lock = acquire_lock(&store, "plan", &ws.config.settings.lock_retry())?;

    let mode = if args.destroy {
        PlanMode::Destroy
    } else {
        PlanMode::Normal
    };
    let changes = make_plan(&ws, &store, &plan_options(&ws, mode, args.targets))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&display::plan_json(&changes))?);
    } else {
        display::show_plan(&changes, ctx.verbose > 0);
    }

    Ok(if changes.has_changes() {
        Outcome::ChangesPending
    } else {
        Outcome::Success
    })
}

pub fn apply(ctx: &Context, args: ApplyArgs) -> Result<Outcome> {
    run(ctx, args, PlanMode::Normal)
}

pub fn destroy(ctx: &Context, args: ApplyArgs) -> Result<Outcome> {
    run(ctx, args, PlanMode::Destroy)
}

fn confirm_proceed(mode: PlanMode) -> Result<bool> {
    use dialoguer::Confirm;

    let prompt = match mode {
        PlanMode::Normal => "Apply these changes?",
        PlanMode::Destroy => "Destroy all of these nodes?",
    };
    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmed)
}

fn run(ctx: &Context, args: ApplyArgs, mode: PlanMode) -> Result<Outcome> {
    let ws = Workspace::load(ctx, &args.vars)?;
    let store = ws.open_store()?;
    let operation = match mode {
        PlanMode::Normal => "apply",
        PlanMode::Destroy => "destroy",
    };
    let lock = acquire_lock(&store, operation, &ws.config.settings.lock_retry())?;
    log::debug!("Holding state lock {}", lock.info().id);

    let changes = make_plan(&ws, &store, &plan_options(&ws, mode, args.targets))?;
    if !ctx.quiet {
        display::show_plan(&changes, ctx.verbose > 0);
    }

    if !changes.has_changes() {
        if mode == PlanMode::Normal {
            refresh_outputs(&ws, &store)?;
        }
        return Ok(Outcome::Success);
    }

    if !args.yes && !confirm_proceed(mode)? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(Outcome::Failed);
    }

    let options = ExecuteOptions {
        jobs: args
            .parallelism
            .unwrap_or(ws.config.settings.parallelism)
            .max(1),
        timeout: args.timeout.map(Duration::from_secs),
        cancel: signal::install(),
    };

    if !ctx.quiet {
        println!();
        println!(
            "  {} Applying {} with up to {} at once...",
            "→".cyan(),
            ui::count(changes.summary().total(), "change"),
            options.jobs
        );
    }

    let mut progress = ApplyProgress::new(ctx.quiet);
    let report = reconcile::apply(
        &changes,
        &store,
        &ProviderRegistry::with_builtins(),
        &CommandHookRunner,
        &options,
        &mut progress,
    )?;

    match mode {
        PlanMode::Normal => refresh_outputs(&ws, &store)?,
        // Outputs go once nothing is left to report on
        PlanMode::Destroy => {
            if store.snapshot()?.is_empty() {
                store.set_outputs(Default::default())?;
            }
        }
    }

    if !ctx.quiet {
        display::show_report(&report);
    }
    if options.cancel.is_cancelled() {
        ui::warn("Interrupted: state holds every change that finished");
    }

    Ok(if report.is_success() {
        Outcome::Success
    } else {
        Outcome::Failed
    })
}

/// Re-evaluate root outputs against the current state and persist them.
///
/// Outputs that cannot be evaluated (their node failed) leave the previous
/// outputs in place.
fn refresh_outputs(ws: &Workspace, store: &dyn StateStore) -> Result<()> {
    if ws.config.outputs.is_empty() {
        return Ok(());
    }
    let snapshot = store.snapshot()?;
    match ws.config.evaluate_outputs(&ws.vars, &snapshot) {
        Ok(outputs) => {
            display::show_outputs(&outputs);
            store
                .set_outputs(outputs)
                .context("Failed to save outputs")?;
        }
        Err(e) => ui::warn(&format!("Outputs not updated: {e}")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::VarArgs;
    use crate::commands::test_context;
    use reconcile::LocalStateStore;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_config(dir: &Path, target: &Path) {
        fs::write(
            dir.join("main.lf.toml"),
            format!(
                r#"
[variable.message]
type = "string"
default = "hello"

[[resource]]
type = "local_file"
name = "motd"
attributes = {{ filename = "{}", content = "${{var.message}}" }}

[[resource]]
type = "null_resource"
name = "after"
depends_on = ["local_file.motd"]
attributes = {{ path = "${{local_file.motd.path}}" }}

[output.digest]
value = "${{local_file.motd.id}}"
"#,
                target.display()
            ),
        )
        .unwrap();
    }

    fn apply_args(vars: &[&str]) -> ApplyArgs {
        ApplyArgs {
            vars: VarArgs {
                vars: vars.iter().map(ToString::to_string).collect(),
                var_files: Vec::new(),
            },
            yes: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_apply_replan_destroy() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out/motd");
        write_config(dir.path(), &target);
        let ctx = test_context(dir.path());

        let outcome = plan(&ctx, PlanArgs::default()).unwrap();
        assert_eq!(outcome, Outcome::ChangesPending);
        assert!(!target.exists());

        assert_eq!(apply(&ctx, apply_args(&[])).unwrap(), Outcome::Success);
        assert_eq!(fs::read_to_string(&target).unwrap(), "hello");

        let store = LocalStateStore::open(dir.path().join("landform.state.json")).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(
            snapshot.outputs["digest"].value,
            snapshot.records["local_file.motd"].outputs["id"]
        );

        // Second plan is clean
        assert_eq!(plan(&ctx, PlanArgs::default()).unwrap(), Outcome::Success);

        // Changing a variable updates in place
        assert_eq!(apply(&ctx, apply_args(&["message=bye"])).unwrap(), Outcome::Success);
        assert_eq!(fs::read_to_string(&target).unwrap(), "bye");

        assert_eq!(destroy(&ctx, apply_args(&[])).unwrap(), Outcome::Success);
        assert!(!target.exists());
        let store = LocalStateStore::open(dir.path().join("landform.state.json")).unwrap();
        let snapshot = store.snapshot().unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.outputs.is_empty());
    }

    #[test]
    fn test_dependent_file_follows_changed_digest() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a");
        let second = dir.path().join("b");
        fs::write(
            dir.path().join("main.lf.toml"),
            format!(
                r#"
[variable.content]
type = "string"
default = "one"

[[resource]]
type = "local_file"
name = "a"
attributes = {{ filename = "{}", content = "${{var.content}}" }}

[[resource]]
type = "local_file"
name = "b"
attributes = {{ filename = "{}", content = "${{local_file.a.id}}" }}
"#,
                first.display(),
                second.display()
            ),
        )
        .unwrap();
        let ctx = test_context(dir.path());

        assert_eq!(apply(&ctx, apply_args(&[])).unwrap(), Outcome::Success);
        assert_eq!(apply(&ctx, apply_args(&["content=two"])).unwrap(), Outcome::Success);

        let store = LocalStateStore::open(dir.path().join("landform.state.json")).unwrap();
        let snapshot = store.snapshot().unwrap();
        let digest = snapshot.records["local_file.a"].outputs["id"].to_template_string();
        assert_eq!(fs::read_to_string(&second).unwrap(), digest);

        let args = PlanArgs {
            vars: VarArgs {
                vars: vec!["content=two".to_string()],
                var_files: Vec::new(),
            },
            ..Default::default()
        };
        assert_eq!(plan(&ctx, args).unwrap(), Outcome::Success);
    }

    #[test]
    fn test_plan_reports_lock_held() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), &dir.path().join("motd"));
        let ctx = test_context(dir.path());

        let store = LocalStateStore::open(dir.path().join("landform.state.json")).unwrap();
        let held = store.lock("apply").unwrap();

        fs::write(
            dir.path().join("settings.lf.toml"),
            "[settings]\nlock_retries = 0\nlock_retry_delay_ms = 1\n",
        )
        .unwrap();
        let err = plan(&ctx, PlanArgs::default()).unwrap_err();
        assert!(format!("{err:#}").contains(&held.id));
    }
}
