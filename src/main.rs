mod cli;
mod commands;
mod display;
mod progress;
mod signal;
mod ui;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Configuration directory or file
    pub dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        dir: cli.dir,
    };

    let result = match cli.command {
        Command::Plan(args) => commands::plan::plan(&ctx, args),
        Command::Apply(args) => commands::plan::apply(&ctx, args),
        Command::Destroy(args) => commands::plan::destroy(&ctx, args),
        Command::Validate(args) => commands::inspect::validate(&ctx, &args),
        Command::Show { json } => commands::inspect::show(&ctx, json),
        Command::Output { name, json } => commands::inspect::output(&ctx, name.as_deref(), json),
        Command::ForceUnlock { lock_id, yes } => commands::unlock::run(&ctx, &lock_id, yes),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "landform", &mut io::stdout());
            Ok(commands::Outcome::Success)
        }
    };

    match result {
        Ok(outcome) => outcome.into(),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
