pub mod inspect;
pub mod plan;
pub mod unlock;

use anyhow::{Context as AnyhowContext, Result};
use reconcile::{Configuration, Graph, LocalStateStore, ResolvedVariables};
use std::collections::BTreeSet;
use std::process::ExitCode;

use crate::Context;
use crate::cli::VarArgs;

/// How a command ended, mapped onto the process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do (exit 0)
    Success,
    /// `plan` found changes (exit 2)
    ChangesPending,
    /// Some nodes failed, or the user declined (exit 1)
    Failed,
}

impl Outcome {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::ChangesPending => 2,
        }
    }
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        Self::from(outcome.code())
    }
}

/// Configuration loaded and variables resolved
pub struct Workspace {
    pub config: Configuration,
    pub vars: ResolvedVariables,
}

impl Workspace {
    /// Load the configuration under `ctx.dir` and resolve its variables
    pub fn load(ctx: &Context, args: &VarArgs) -> Result<Self> {
        let config = load_config(ctx)?;
        let sources = config
            .sources(&args.var_files, &args.vars)
            .context("Failed to read variable sources")?;
        let vars = reconcile::resolve(&config.variables, &sources)
            .context("Failed to resolve variables")?;
        log::debug!("Resolved {} variables", vars.len());
        Ok(Self { config, vars })
    }

    /// Build the dependency graph and check outputs against it
    pub fn graph(&self) -> Result<Graph> {
        let nodes = self.config.nodes(&self.vars)?;
        let graph = reconcile::build(nodes).context("Invalid dependency graph")?;
        let ids: BTreeSet<String> = graph.nodes().map(|n| n.id.clone()).collect();
        self.config.check_outputs(&ids)?;
        Ok(graph)
    }

    pub fn open_store(&self) -> Result<LocalStateStore> {
        open_store(&self.config)
    }
}

/// Load the configuration without resolving variables
pub fn load_config(ctx: &Context) -> Result<Configuration> {
    Configuration::load(&ctx.dir)
        .with_context(|| format!("Failed to load configuration from {}", ctx.dir.display()))
}

pub fn open_store(config: &Configuration) -> Result<LocalStateStore> {
    let path = config.state_path();
    LocalStateStore::open(&path)
        .with_context(|| format!("Failed to open state file {}", path.display()))
}

#[cfg(test)]
pub fn test_context(dir: &std::path::Path) -> Context {
    Context {
        verbose: 0,
        quiet: true,
        dir: dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(Outcome::Success.code(), 0);
        assert_eq!(Outcome::Failed.code(), 1);
        assert_eq!(Outcome::ChangesPending.code(), 2);
    }

    #[test]
    fn test_workspace_resolves_cli_variables() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.lf.toml"),
            r#"
[variable.greeting]
type = "string"

[[resource]]
type = "null_resource"
name = "hello"
attributes = { message = "${var.greeting}" }
"#,
        )
        .unwrap();
        let args = VarArgs {
            vars: vec!["greeting=hi".to_string()],
            var_files: Vec::new(),
        };
        let ws = Workspace::load(&test_context(dir.path()), &args).unwrap();
        let graph = ws.graph().unwrap();
        let node = graph.node("null_resource.hello").unwrap();
        assert_eq!(node.attributes["message"], reconcile::Value::from("hi"));
    }

    #[test]
    fn test_missing_configuration_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(&test_context(dir.path())).err().unwrap();
        assert!(format!("{err:#}").contains("Failed to load configuration"));
    }
}
