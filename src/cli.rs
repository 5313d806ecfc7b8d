use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "landform")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declarative infrastructure configuration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration directory (or a single *.lf.toml file)
    #[arg(
        short = 'C',
        long = "dir",
        global = true,
        default_value = ".",
        env = "LANDFORM_DIR"
    )]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(PlanArgs),

    /// Plan, confirm and apply changes
    Apply(ApplyArgs),

    /// Destroy every node recorded in state
    Destroy(ApplyArgs),

    /// Check the configuration without touching state
    Validate(VarArgs),

    /// List the nodes recorded in state
    Show {
        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print root outputs
    Output {
        /// Only this output (printed even if sensitive)
        name: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Release a state lock left behind by a crashed run
    ForceUnlock {
        /// Lock ID reported by the failed run
        lock_id: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Where input variables come from
#[derive(Args, Debug, Clone, Default)]
pub struct VarArgs {
    /// Set an input variable
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Load input variables from a TOML file (repeatable, later files win)
    #[arg(long = "var-file", value_name = "FILE")]
    pub var_files: Vec<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PlanArgs {
    #[command(flatten)]
    pub vars: VarArgs,

    /// Limit planning to these addresses and what they depend on
    #[arg(long = "target", value_name = "ADDRESS")]
    pub targets: Vec<String>,

    /// Plan the destruction of everything in state
    #[arg(long)]
    pub destroy: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub vars: VarArgs,

    /// Limit the run to these addresses
    #[arg(long = "target", value_name = "ADDRESS")]
    pub targets: Vec<String>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum changes applied at once (defaults to settings.parallelism)
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,

    /// Stop starting new changes after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_flags() {
        let cli = Cli::try_parse_from([
            "landform",
            "-C",
            "infra",
            "apply",
            "-y",
            "--var",
            "region=eu-west-1",
            "--var-file",
            "prod.toml",
            "--target",
            "local_file.motd",
            "-j",
            "8",
        ])
        .unwrap();
        assert_eq!(cli.dir, PathBuf::from("infra"));
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert!(args.yes);
        assert_eq!(args.vars.vars, vec!["region=eu-west-1"]);
        assert_eq!(args.vars.var_files, vec![PathBuf::from("prod.toml")]);
        assert_eq!(args.targets, vec!["local_file.motd"]);
        assert_eq!(args.parallelism, Some(8));
    }

    #[test]
    fn test_parse_plan_destroy() {
        let cli = Cli::try_parse_from(["landform", "plan", "--destroy"]).unwrap();
        assert!(matches!(cli.command, Command::Plan(PlanArgs { destroy: true, .. })));
    }
}
