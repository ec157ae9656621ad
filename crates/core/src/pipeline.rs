//! Progressive build pipeline
//!
//! A single-threaded, cooperative stage runner. Phase hashes are computed
//! once up front and frozen; the snapshot cache picks the resume point; the
//! run loop walks phases from there to the target, dispatching before/after
//! hooks around each handler and committing a labeled snapshot after every
//! snapshot-producing phase. Only `final` re-computes hashes at commit time
//! to absorb drift that happened mid-run (a pre-existing clone advancing,
//! a source file changing).
//!
//! Failure semantics: the first error aborts the run wrapped with the phase
//! name. Snapshots committed earlier in the run are kept; they stay valid
//! resume points. The build container is removed by the caller's cleanup
//! path, found by its habitat name prefix.

use crate::cleanup::CleanupCoordinator;
use crate::config::CoalescedConfig;
use crate::errors::{HabitatError, Result};
use crate::handlers::{apply_file_entry, run_phase, run_script_entry, PhaseCtx};
use crate::hasher::PhaseHasher;
use crate::phases::{self, Phase, PHASES};
use crate::progress::{ProgressEvent, ProgressObserver};
use crate::repos::RepoSpec;
use crate::runtime::ContainerRuntime;
use crate::snapshot::{self, image_name, resolve_resume, Rebuild, RESULT_LABEL, TIMESTAMP_LABEL};
use indexmap::IndexMap;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Caller-supplied knobs for one pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Last phase to execute; defaults to `final`
    pub target: Option<String>,
    /// Cache override
    pub rebuild: Rebuild,
    /// Repositories cloned after the configured ones
    pub extra_repos: Vec<RepoSpec>,
}

/// What a completed run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Image for the target state (the last snapshot committed or reused)
    pub image: String,
    /// Build container id; `None` when the target was fully cached
    pub container: Option<String>,
    /// Phases executed this run, in order
    pub phases_run: Vec<&'static str>,
    /// Whether the target came straight from the cache
    pub cached: bool,
}

/// Ordered stage runner over one coalesced config
pub struct Pipeline<'a, R: ContainerRuntime> {
    runtime: &'a R,
    config: &'a CoalescedConfig,
    observer: &'a dyn ProgressObserver,
    coordinator: Option<&'a CleanupCoordinator>,
    options: PipelineOptions,
}

impl<'a, R: ContainerRuntime> Pipeline<'a, R> {
    pub fn new(
        runtime: &'a R,
        config: &'a CoalescedConfig,
        observer: &'a dyn ProgressObserver,
    ) -> Self {
        Self {
            runtime,
            config,
            observer,
            coordinator: None,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach the cleanup coordinator so interrupts stop the run at the
    /// next phase boundary
    pub fn with_coordinator(mut self, coordinator: &'a CleanupCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.coordinator.is_some_and(|c| c.interrupted()) {
            return Err(HabitatError::Interrupted);
        }
        Ok(())
    }

    /// Execute the pipeline up to the target phase
    #[instrument(skip(self), fields(habitat = %self.config.name))]
    pub async fn run(&self) -> Result<BuildOutput> {
        let hasher = PhaseHasher::new(self.config);
        let mut hashes = hasher.hash_all();

        let target_name = self.options.target.as_deref().unwrap_or("final");
        let target_index = phases::index_of(target_name)?;

        let plan = resolve_resume(
            self.runtime,
            &self.config.name,
            &hashes,
            target_index,
            &self.options.rebuild,
        )
        .await?;

        if let Some(cached) = plan.cached_target {
            info!("Using cached snapshot: {}", cached);
            self.observer.on_event(&ProgressEvent::cache_hit(&cached));
            return Ok(BuildOutput {
                image: cached,
                container: None,
                phases_run: Vec::new(),
                cached: true,
            });
        }

        let mut ctx = PhaseCtx::new(
            self.runtime,
            self.config,
            self.options.extra_repos.clone(),
        );
        let mut last_image = plan.base_image.clone().unwrap_or_default();

        if plan.start_index > 0 {
            let base = plan.base_image.as_deref().ok_or_else(|| {
                HabitatError::Runtime(crate::errors::RuntimeError::UnexpectedOutput {
                    kind: "resume".to_string(),
                    detail: "resume point without a base snapshot".to_string(),
                })
            })?;
            self.observer.on_event(&ProgressEvent::cache_resume(
                base,
                PHASES[plan.start_index].name,
            ));
            let name = format!(
                "{}-build-{}",
                snapshot::habitat_prefix(&self.config.name),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or(0)
            );
            let container = self
                .runtime
                .run_detached(
                    base,
                    Some(&name),
                    &[],
                    &[],
                    &["sleep".to_string(), "infinity".to_string()],
                )
                .await?;
            debug!(container = %container, "Resumed build container from snapshot");
            ctx.container = Some(container);
        }

        let mut phases_run = Vec::new();
        for index in plan.start_index..=target_index {
            self.check_interrupt()?;
            let phase = &PHASES[index];
            self.observer
                .on_event(&ProgressEvent::phase_begin(phase.name, index));
            let started = Instant::now();

            let timeout = self.config.timeouts.for_phase(phase.name);
            let outcome = match tokio::time::timeout(timeout, self.execute_phase(&mut ctx, phase))
                .await
            {
                Ok(result) => result.map_err(|e| e.at_phase(phase.name)),
                Err(_) => Err(HabitatError::PhaseTimeout {
                    phase: phase.name.to_string(),
                    seconds: timeout.as_secs(),
                }),
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            self.observer.on_event(&ProgressEvent::phase_end(
                phase.name,
                duration_ms,
                outcome.is_ok(),
            ));
            outcome?;
            phases_run.push(phase.name);

            if phase.snapshot {
                if phase.name == "final" {
                    hashes = hasher.hash_all();
                }
                let labels = snapshot_labels(&hashes, index);
                let image = image_name(&self.config.name, phase);
                let change = if phase.name == "final" {
                    ctx.entrypoint_change.as_deref()
                } else {
                    None
                };
                let container = ctx.container.clone().ok_or_else(|| {
                    HabitatError::Runtime(crate::errors::RuntimeError::UnexpectedOutput {
                        kind: "commit".to_string(),
                        detail: "no build container to commit".to_string(),
                    })
                })?;
                self.runtime
                    .commit(&container, &image, &labels, change)
                    .await
                    .map_err(|e| e.at_phase(phase.name))?;
                debug!(image = %image, "Committed snapshot");
                self.observer
                    .on_event(&ProgressEvent::snapshot_created(phase.name, &image));
                last_image = image;
            }
        }

        Ok(BuildOutput {
            image: last_image,
            container: ctx.container,
            phases_run,
            cached: false,
        })
    }

    /// Hooks and handler for one phase: before-file, before-script,
    /// handler, after-file, after-script
    async fn execute_phase(&self, ctx: &mut PhaseCtx<'_, R>, phase: &Phase) -> Result<()> {
        let file_hooks = |slot: fn(&crate::config::FileEntry) -> Option<&String>| {
            self.config
                .files
                .iter()
                .filter(move |e| slot(e).map(String::as_str) == Some(phase.name))
                .cloned()
                .collect::<Vec<_>>()
        };
        let script_hooks = |slot: fn(&crate::config::ScriptEntry) -> Option<&String>| {
            self.config
                .scripts
                .iter()
                .filter(move |e| slot(e).map(String::as_str) == Some(phase.name))
                .cloned()
                .collect::<Vec<_>>()
        };

        for entry in file_hooks(|e| e.before.as_ref()) {
            apply_file_entry(ctx, &entry).await?;
        }
        for entry in script_hooks(|e| e.before.as_ref()) {
            run_script_entry(ctx, &entry).await?;
        }

        run_phase(ctx, phase).await?;

        for entry in file_hooks(|e| e.after.as_ref()) {
            apply_file_entry(ctx, &entry).await?;
        }
        for entry in script_hooks(|e| e.after.as_ref()) {
            run_script_entry(ctx, &entry).await?;
        }
        Ok(())
    }
}

/// Label set for a snapshot at phase `index`: the hash of every phase up to
/// and including it, the build result, and the commit timestamp
fn snapshot_labels(
    hashes: &IndexMap<&'static str, String>,
    index: usize,
) -> IndexMap<String, String> {
    let mut labels: IndexMap<String, String> = PHASES
        .iter()
        .take(index + 1)
        .map(|phase| {
            (
                phase.hash_label(),
                hashes.get(phase.name).cloned().unwrap_or_default(),
            )
        })
        .collect();
    labels.insert(RESULT_LABEL.to_string(), "pass".to_string());
    labels.insert(
        TIMESTAMP_LABEL.to_string(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    labels
}
