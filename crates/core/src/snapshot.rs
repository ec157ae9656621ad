//! Snapshot cache lookup
//!
//! Snapshots are images committed after each phase, named
//! `habitat-<name>:<id>-<phase>` and labeled with the hash of every phase
//! executed so far. Resume resolution walks the phase table backwards and
//! picks the highest snapshot whose labels match the current hashes for all
//! earlier phases. Later-phase drift is expected; that is what we are
//! resuming over.
//!
//! A hash mismatch never surfaces as an error; it only disqualifies the
//! candidate.

use crate::errors::Result;
use crate::phases::{self, Phase, PHASES};
use crate::runtime::ContainerRuntime;
use indexmap::IndexMap;
use tracing::{debug, instrument};

/// Label carrying the overall build result on snapshot images
pub const RESULT_LABEL: &str = "habitat.result";
/// Label carrying the snapshot commit time, ISO-8601 UTC
pub const TIMESTAMP_LABEL: &str = "habitat.timestamp";

/// Image name for one habitat's phase snapshot
pub fn image_name(habitat: &str, phase: &Phase) -> String {
    format!("habitat-{}:{}", habitat, phase.tag_suffix())
}

/// Name prefix shared by a habitat's containers and snapshots
pub fn habitat_prefix(habitat: &str) -> String {
    format!("habitat-{}", habitat)
}

/// Rebuild overrides from the CLI
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Rebuild {
    /// Use the cache normally
    #[default]
    No,
    /// Ignore all cache
    Full,
    /// Force a rebuild starting from the named phase
    From(String),
}

/// Where the pipeline should start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Zero-based index of the first phase to execute
    pub start_index: usize,
    /// Snapshot image to start the build container from, when resuming
    pub base_image: Option<String>,
    /// Set when the target phase is already cached; no phases will run
    pub cached_target: Option<String>,
}

impl ResumePlan {
    fn from_scratch() -> Self {
        Self {
            start_index: 0,
            base_image: None,
            cached_target: None,
        }
    }
}

/// Resolve the highest valid resume point for a target phase.
///
/// `hashes` are the current phase hashes in registry order. A snapshot at
/// phase k is valid iff its image exists and, for every phase j <= k, the
/// label `<j>.hash` equals the current hash for j.
#[instrument(skip(runtime, hashes))]
pub async fn resolve_resume<R: ContainerRuntime>(
    runtime: &R,
    habitat: &str,
    hashes: &IndexMap<&'static str, String>,
    target_index: usize,
    rebuild: &Rebuild,
) -> Result<ResumePlan> {
    match rebuild {
        Rebuild::Full => {
            debug!("Rebuild requested; ignoring cache");
            return Ok(ResumePlan::from_scratch());
        }
        Rebuild::From(phase_name) => {
            let index = phases::index_of(phase_name)?;
            if index == 0 {
                return Ok(ResumePlan::from_scratch());
            }
            // Resume on top of the nearest snapshot at or before the
            // previous phase; without one, fall back to a full build.
            for k in (0..index).rev() {
                let phase = &PHASES[k];
                if !phase.snapshot {
                    continue;
                }
                let image = image_name(habitat, phase);
                if runtime.image_exists(&image).await? {
                    return Ok(ResumePlan {
                        start_index: index,
                        base_image: Some(image),
                        cached_target: None,
                    });
                }
                break;
            }
            debug!(phase = %phase_name, "No snapshot before rebuild-from phase; starting from scratch");
            return Ok(ResumePlan::from_scratch());
        }
        Rebuild::No => {}
    }

    for k in (0..PHASES.len()).rev() {
        let phase = &PHASES[k];
        if !phase.snapshot {
            continue;
        }
        let image = image_name(habitat, phase);
        if !runtime.image_exists(&image).await? {
            continue;
        }
        let labels = runtime.image_labels(&image).await?;
        if !labels_match(&labels, hashes, k) {
            debug!(image = %image, "Snapshot labels do not match current hashes");
            continue;
        }
        debug!(image = %image, "Found valid snapshot");
        if k >= target_index {
            return Ok(ResumePlan {
                start_index: k + 1,
                base_image: None,
                cached_target: Some(image),
            });
        }
        return Ok(ResumePlan {
            start_index: k + 1,
            base_image: Some(image),
            cached_target: None,
        });
    }

    Ok(ResumePlan::from_scratch())
}

/// Whether a snapshot's labels match the current hashes for every phase
/// j <= k
fn labels_match(
    labels: &IndexMap<String, String>,
    hashes: &IndexMap<&'static str, String>,
    k: usize,
) -> bool {
    PHASES.iter().take(k + 1).all(|phase| {
        match (labels.get(&phase.hash_label()), hashes.get(phase.name)) {
            (Some(label), Some(current)) => label == current,
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RecordingRuntime;

    fn fake_hashes() -> IndexMap<&'static str, String> {
        PHASES
            .iter()
            .map(|p| (p.name, format!("{:012x}", p.id as u64)))
            .collect()
    }

    fn labels_through(hashes: &IndexMap<&'static str, String>, k: usize) -> IndexMap<String, String> {
        let mut labels: IndexMap<String, String> = PHASES
            .iter()
            .take(k + 1)
            .map(|p| (p.hash_label(), hashes[p.name].clone()))
            .collect();
        labels.insert(RESULT_LABEL.to_string(), "pass".to_string());
        labels
    }

    #[tokio::test]
    async fn no_snapshots_starts_from_scratch() {
        let runtime = RecordingRuntime::new();
        let plan = resolve_resume(&runtime, "demo", &fake_hashes(), 11, &Rebuild::No)
            .await
            .unwrap();
        assert_eq!(plan, ResumePlan::from_scratch());
    }

    #[tokio::test]
    async fn resumes_after_highest_valid_snapshot() {
        let runtime = RecordingRuntime::new();
        let hashes = fake_hashes();
        runtime.seed_image("habitat-demo:2-users", labels_through(&hashes, 1));
        let plan = resolve_resume(&runtime, "demo", &hashes, 11, &Rebuild::No)
            .await
            .unwrap();
        assert_eq!(plan.start_index, 2);
        assert_eq!(plan.base_image.as_deref(), Some("habitat-demo:2-users"));
        assert!(plan.cached_target.is_none());
    }

    #[tokio::test]
    async fn stale_early_hash_disqualifies_snapshot() {
        let runtime = RecordingRuntime::new();
        let hashes = fake_hashes();
        let mut stale = labels_through(&hashes, 5);
        stale.insert("env.hash".to_string(), "ffffffffffff".to_string());
        runtime.seed_image("habitat-demo:6-files", stale);
        // The earlier snapshot is still coherent
        runtime.seed_image("habitat-demo:2-users", labels_through(&hashes, 1));
        let plan = resolve_resume(&runtime, "demo", &hashes, 11, &Rebuild::No)
            .await
            .unwrap();
        assert_eq!(plan.start_index, 2);
        assert_eq!(plan.base_image.as_deref(), Some("habitat-demo:2-users"));
    }

    #[tokio::test]
    async fn cached_final_short_circuits() {
        let runtime = RecordingRuntime::new();
        let hashes = fake_hashes();
        runtime.seed_image("habitat-demo:12-final", labels_through(&hashes, 11));
        let plan = resolve_resume(&runtime, "demo", &hashes, 11, &Rebuild::No)
            .await
            .unwrap();
        assert_eq!(plan.cached_target.as_deref(), Some("habitat-demo:12-final"));
    }

    #[tokio::test]
    async fn rebuild_ignores_cache() {
        let runtime = RecordingRuntime::new();
        let hashes = fake_hashes();
        runtime.seed_image("habitat-demo:12-final", labels_through(&hashes, 11));
        let plan = resolve_resume(&runtime, "demo", &hashes, 11, &Rebuild::Full)
            .await
            .unwrap();
        assert_eq!(plan, ResumePlan::from_scratch());
    }

    #[tokio::test]
    async fn rebuild_from_requires_previous_snapshot() {
        let runtime = RecordingRuntime::new();
        let hashes = fake_hashes();

        // Without the phase-6 snapshot, rebuild-from repos falls back
        let plan = resolve_resume(
            &runtime,
            "demo",
            &hashes,
            11,
            &Rebuild::From("repos".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(plan, ResumePlan::from_scratch());

        runtime.seed_image("habitat-demo:6-files", labels_through(&hashes, 5));
        let plan = resolve_resume(
            &runtime,
            "demo",
            &hashes,
            11,
            &Rebuild::From("repos".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(plan.start_index, 6);
        assert_eq!(plan.base_image.as_deref(), Some("habitat-demo:6-files"));
    }

    #[tokio::test]
    async fn rebuild_from_unknown_phase_errors() {
        let runtime = RecordingRuntime::new();
        let err = resolve_resume(
            &runtime,
            "demo",
            &fake_hashes(),
            11,
            &Rebuild::From("bogus".to_string()),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Unknown target phase"));
    }
}
