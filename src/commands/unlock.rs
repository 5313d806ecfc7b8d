//! `force-unlock`

use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use colored::Colorize;
use reconcile::StateStore;

use super::{Outcome, load_config, open_store};
use crate::Context;
use crate::ui;

/// Remove a lock left behind by a run that died; `lock_id` must match
pub fn run(ctx: &Context, lock_id: &str, yes: bool) -> Result<Outcome> {
    let config = load_config(ctx)?;
    let store = open_store(&config)?;

    let Some(held) = store.current_lock()? else {
        ui::info("State is not locked");
        return Ok(Outcome::Success);
    };

    let age = Utc::now().signed_duration_since(held.created);
    ui::header("State lock");
    ui::kv("id", &held.id);
    ui::kv("operation", &held.operation);
    ui::kv("held by", &held.who);
    ui::kv("age", &format!("{}m {}s", age.num_minutes(), age.num_seconds() % 60));

    if !yes {
        use dialoguer::Confirm;

        println!();
        ui::warn("Removing a lock that is still in use can corrupt state");
        let confirmed = Confirm::new()
            .with_prompt("Force unlock?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  {} Aborted", "✗".red());
            return Ok(Outcome::Failed);
        }
    }

    store
        .unlock(lock_id)
        .with_context(|| format!("Failed to release lock {lock_id}"))?;
    ui::success(&format!("Released lock {lock_id}"));
    Ok(Outcome::Success)
}
