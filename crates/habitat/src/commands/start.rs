//! Start command implementation
//!
//! Loads and coalesces the habitat configuration, runs the progressive
//! build pipeline against the docker runtime, and cleans up the build
//! container on the way out. Cleanup runs on success and failure alike;
//! only `--no-cleanup` skips it.

use crate::cli::StartArgs;
use crate::ui::ConsoleObserver;
use habitat_core::cleanup::CleanupCoordinator;
use habitat_core::errors::{CliError, HabitatError, Result};
use habitat_core::pipeline::{Pipeline, PipelineOptions};
use habitat_core::repos::RepoSpec;
use habitat_core::runtime::{CliDocker, ContainerRuntime};
use habitat_core::snapshot::{habitat_prefix, Rebuild};
use habitat_core::{config::ConfigLoader, state};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn execute(root: &Path, strict: bool, args: StartArgs) -> Result<()> {
    let loader = ConfigLoader::new(root).strict(strict);
    let habitat = match args.habitat.clone() {
        Some(habitat) => habitat,
        None => state::last_used(root)
            .map(|p| p.display().to_string())
            .ok_or_else(|| {
                HabitatError::Cli(CliError::InvalidArgument {
                    message: "no habitat given and no last-used config recorded".to_string(),
                })
            })?,
    };
    let config_path = loader.habitat_config_path(&habitat);
    let config = loader.load(&config_path)?;
    info!(habitat = %config.name, "Starting habitat build");

    let extra_repos = args
        .repos
        .iter()
        .map(|s| RepoSpec::parse(s))
        .collect::<Result<Vec<_>>>()?;
    let rebuild = if args.rebuild {
        Rebuild::Full
    } else if let Some(phase) = args.rebuild_from.clone() {
        Rebuild::From(phase)
    } else {
        Rebuild::No
    };

    let coordinator = Arc::new(CleanupCoordinator::new());
    coordinator.install_signal_handler();

    let runtime = CliDocker::new();
    let observer = ConsoleObserver;
    let options = PipelineOptions {
        target: args.target.clone(),
        rebuild,
        extra_repos,
    };
    let pipeline = Pipeline::new(&runtime, &config, &observer)
        .with_coordinator(&coordinator)
        .with_options(options);

    let result = pipeline.run().await;

    if !args.no_cleanup {
        // The build container is ours regardless of peers; the shared sweep
        // below respects the last-process rule.
        if let Ok(output) = &result {
            if let Some(container) = &output.container {
                if let Err(e) = runtime.remove(container).await {
                    warn!(container = %container, "Could not remove build container: {}", e);
                }
            }
        }
        coordinator
            .run(&runtime, &habitat_prefix(&config.name), false, &observer)
            .await;
    }

    let output = result?;
    state::record_last_used(root, &config_path);

    if let Some(command) = &args.override_command {
        if let Some(delay) = config.entry.startup_delay {
            debug!(seconds = delay, "Applying startup delay");
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        if args.tty || config.entry.tty.unwrap_or(false) {
            debug!("TTY requested; override command runs detached regardless");
        }
        let argv = shell_words::split(command).map_err(|e| {
            HabitatError::Cli(CliError::InvalidArgument {
                message: format!("could not parse --cmd: {}", e),
            })
        })?;
        let container = runtime
            .run_detached(&output.image, None, &[], &[], &argv)
            .await?;
        println!("Started {} from {}", container, output.image);
        return Ok(());
    }

    if output.cached {
        println!("Habitat image up to date: {}", output.image);
    } else {
        println!("Habitat image ready: {}", output.image);
    }
    Ok(())
}
