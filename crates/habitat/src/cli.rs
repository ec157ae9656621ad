//! Command-line interface
//!
//! Thin clap layer over the core pipeline. Exit codes: 0 on success, 130
//! when the user interrupted the run, 1 on any other error.

use clap::{Args, Parser, Subcommand};
use habitat_core::errors::HabitatError;
use std::path::PathBuf;

use crate::commands;
use crate::ui;

/// Exit code for a user interrupt
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Build and run isolated habitat containers for coding agents"
)]
pub struct Cli {
    /// Habitats root directory (tiers live in system/, shared/, habitats/);
    /// defaults to $HABITAT_ROOT, then the current directory
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Fail on unknown configuration keys instead of warning
    #[arg(long, global = true)]
    pub strict: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a habitat image, resuming from the cache where possible
    Start(StartArgs),
    /// Print the current phase hashes for a habitat
    Hash(HashArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Habitat name or path to its config.yaml; defaults to the last used
    pub habitat: Option<String>,

    /// Extra repository to clone, url[:path[:branch]] (repeatable)
    #[arg(long = "repo")]
    pub repos: Vec<String>,

    /// Ignore all cached snapshots
    #[arg(long)]
    pub rebuild: bool,

    /// Rebuild starting from this phase
    #[arg(long, conflicts_with = "rebuild")]
    pub rebuild_from: Option<String>,

    /// Stop after this phase instead of `final`
    #[arg(long)]
    pub target: Option<String>,

    /// Command to run in the built container instead of its entrypoint
    #[arg(long = "cmd")]
    pub override_command: Option<String>,

    /// Force a TTY for the override command
    #[arg(long)]
    pub tty: bool,

    /// Leave build containers and dangling images behind
    #[arg(long)]
    pub no_cleanup: bool,
}

#[derive(Args, Debug)]
pub struct HashArgs {
    /// Habitat name or path to its config.yaml
    pub habitat: String,
}

impl Cli {
    /// Run the selected command and map the outcome to an exit code
    pub fn dispatch(self) -> i32 {
        let root = self
            .root
            .clone()
            .or_else(|| std::env::var_os("HABITAT_ROOT").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                eprintln!("Could not start async runtime: {}", e);
                return 1;
            }
        };

        let result = match self.command {
            Commands::Start(args) => {
                runtime.block_on(commands::start::execute(&root, self.strict, args))
            }
            Commands::Hash(args) => {
                runtime.block_on(commands::hash::execute(&root, self.strict, args))
            }
        };

        match result {
            Ok(()) => 0,
            Err(HabitatError::Interrupted) => {
                eprintln!("Interrupted.");
                EXIT_INTERRUPTED
            }
            Err(err) => {
                eprint!("{}", ui::render_error(&err));
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_start_flags() {
        let cli = Cli::parse_from([
            "habitat",
            "start",
            "demo",
            "--repo",
            "https://example.com/x:/work/x",
            "--rebuild-from",
            "repos",
            "--target",
            "verify",
            "--no-cleanup",
        ]);
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.habitat.as_deref(), Some("demo"));
        assert_eq!(args.repos.len(), 1);
        assert_eq!(args.rebuild_from.as_deref(), Some("repos"));
        assert_eq!(args.target.as_deref(), Some("verify"));
        assert!(args.no_cleanup);
        assert!(!args.rebuild);
    }
}
