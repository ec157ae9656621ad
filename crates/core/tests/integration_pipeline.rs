//! Integration tests for the progressive build pipeline, driven by the
//! recording runtime

mod common;

use common::{TestRoot, DEMO_CONFIG};
use habitat_core::cleanup::CleanupCoordinator;
use habitat_core::config::ConfigLoader;
use habitat_core::errors::HabitatError;
use habitat_core::phases::PHASES;
use habitat_core::pipeline::{Pipeline, PipelineOptions};
use habitat_core::progress::{CollectingObserver, NullObserver, ProgressEvent};
use habitat_core::repos::RepoSpec;
use habitat_core::runtime::RecordingRuntime;
use habitat_core::snapshot::Rebuild;
use std::fs;

const FULL_CONFIG: &str = r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
  - HABITAT_PATH=/workspace/habitat
"#;

#[tokio::test]
async fn fresh_build_runs_all_phases_and_labels_final() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    let observer = CollectingObserver::new();

    let output = Pipeline::new(&runtime, &config, &observer)
        .run()
        .await
        .unwrap();

    assert!(!output.cached);
    assert_eq!(output.image, "habitat-demo:12-final");
    let names: Vec<&str> = PHASES.iter().map(|p| p.name).collect();
    assert_eq!(output.phases_run, names);

    // Snapshot-producing phases committed an image each; verify and test
    // did not.
    let tags = runtime.image_tags();
    for phase in PHASES {
        let tag = format!("habitat-demo:{}-{}", phase.id, phase.name);
        assert_eq!(tags.contains(&tag), phase.snapshot, "{}", phase.name);
    }

    // The final snapshot carries a hash label for all twelve phases.
    let labels = runtime.labels_of("habitat-demo:12-final").unwrap();
    for phase in PHASES {
        assert!(labels.contains_key(&phase.hash_label()), "{}", phase.name);
    }
    assert_eq!(labels["habitat.result"], "pass");
    assert!(labels.contains_key("habitat.timestamp"));

    // An early snapshot only carries labels up to its own phase.
    let users_labels = runtime.labels_of("habitat-demo:2-users").unwrap();
    assert!(users_labels.contains_key("base.hash"));
    assert!(users_labels.contains_key("users.hash"));
    assert!(!users_labels.contains_key("env.hash"));
}

#[tokio::test]
async fn unchanged_second_run_hits_the_cache() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();

    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();
    let log_after_first = runtime.log().len();

    let observer = CollectingObserver::new();
    let output = Pipeline::new(&runtime, &config, &observer)
        .run()
        .await
        .unwrap();

    assert!(output.cached);
    assert_eq!(output.image, "habitat-demo:12-final");
    assert!(output.container.is_none());
    assert!(output.phases_run.is_empty());
    // No container was created, nothing was executed.
    assert_eq!(runtime.log().len(), log_after_first);
    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::CacheHit { image, .. } if image == "habitat-demo:12-final")));
}

#[tokio::test]
async fn env_change_resumes_after_users() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();

    root.write_habitat(
        "demo",
        r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
  - FOO=bar
"#,
    );
    let changed = ConfigLoader::new(root.path()).load(&path).unwrap();
    let observer = CollectingObserver::new();
    let output = Pipeline::new(&runtime, &changed, &observer)
        .run()
        .await
        .unwrap();

    assert_eq!(output.phases_run.first().copied(), Some("env"));
    assert_eq!(output.phases_run.len(), 10);
    assert!(observer.events().iter().any(|e| matches!(
        e,
        ProgressEvent::CacheResume { image, start_phase, .. }
            if image == "habitat-demo:2-users" && start_phase == "env"
    )));

    // The resumed final image carries the same phase-hash labels as a full
    // rebuild from scratch.
    let fresh_runtime = RecordingRuntime::new();
    Pipeline::new(&fresh_runtime, &changed, &NullObserver)
        .run()
        .await
        .unwrap();
    let resumed = runtime.labels_of("habitat-demo:12-final").unwrap();
    let scratch = fresh_runtime.labels_of("habitat-demo:12-final").unwrap();
    for phase in PHASES {
        let label = phase.hash_label();
        assert_eq!(resumed.get(&label), scratch.get(&label), "{}", label);
    }
}

#[tokio::test]
async fn file_content_change_resumes_at_files() {
    let root = TestRoot::new();
    let config_text = r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
files:
  - src: ./a.sh
    dest: /workspace/a.sh
    mode: 755
"#;
    let path = root.write_habitat("demo", config_text);
    fs::write(root.habitat_dir("demo").join("a.sh"), "echo one\n").unwrap();
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();

    fs::write(root.habitat_dir("demo").join("a.sh"), "echo two\n").unwrap();
    let changed = ConfigLoader::new(root.path()).load(&path).unwrap();
    let output = Pipeline::new(&runtime, &changed, &NullObserver)
        .run()
        .await
        .unwrap();

    assert_eq!(output.phases_run.first().copied(), Some("files"));
}

#[tokio::test]
async fn hooks_run_in_declared_order_around_the_phase() {
    let root = TestRoot::new();
    let path = root.write_habitat(
        "demo",
        r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
files:
  - src: ./hook.txt
    dest: /tmp/hook.txt
    before: scripts
scripts:
  - commands:
      - echo before-hook
    before: scripts
  - commands:
      - echo after-hook
    after: scripts
"#,
    );
    fs::write(root.habitat_dir("demo").join("hook.txt"), "hook\n").unwrap();
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();

    let log = runtime.log();
    let file_hook = log
        .iter()
        .position(|l| l.starts_with("cp") && l.contains("/tmp/hook.txt"))
        .expect("file hook ran");
    let before_script = log
        .iter()
        .position(|l| l.contains("echo before-hook"))
        .expect("before script ran");
    let entrypoint = log
        .iter()
        .position(|l| l.contains("/entrypoint.sh"))
        .expect("scripts handler ran");
    let after_script = log
        .iter()
        .position(|l| l.contains("echo after-hook"))
        .expect("after script ran");

    assert!(file_hook < before_script, "file hooks precede script hooks");
    assert!(before_script < entrypoint, "before hooks precede the handler");
    assert!(entrypoint < after_script, "after hooks follow the handler");
}

#[tokio::test]
async fn habitat_tree_is_copied_unless_bypassed() {
    let root = TestRoot::new();
    root.write_tier("system", "env:\n  - USER=root\n  - WORKDIR=/root\n");
    let path = root.write_habitat("demo", FULL_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();
    assert!(
        runtime
            .log()
            .iter()
            .any(|l| l.starts_with("cp") && l.contains("/workspace/habitat/system/")),
        "system tier copied into the habitat tree"
    );

    let bypassed = format!(
        "{}entry:\n  bypass_habitat_construction: true\n",
        FULL_CONFIG
    );
    root.write_habitat("demo", &bypassed);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();
    assert!(
        !runtime
            .log()
            .iter()
            .any(|l| l.starts_with("cp") && l.contains("/workspace/habitat/")),
        "bypass mode copies nothing into the habitat tree"
    );
}

#[tokio::test]
async fn repos_clone_inside_the_container() {
    let root = TestRoot::new();
    let path = root.write_habitat(
        "demo",
        r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
repos:
  - url: https://example.com/x
    path: ${WORKDIR}/x
    branch: main
"#,
    );
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    let options = PipelineOptions {
        extra_repos: vec![RepoSpec::parse("git@github.com:o/extra:/workspace/extra").unwrap()],
        ..Default::default()
    };
    Pipeline::new(&runtime, &config, &NullObserver)
        .with_options(options)
        .run()
        .await
        .unwrap();

    let log = runtime.log();
    let configured = log
        .iter()
        .position(|l| l.contains("git clone") && l.contains("/workspace/x"))
        .expect("configured repo cloned");
    let extra = log
        .iter()
        .position(|l| l.contains("git clone") && l.contains("/workspace/extra"))
        .expect("extra repo cloned");
    assert!(configured < extra, "extra repos clone after configured ones");
    assert!(
        log.iter().any(|l| l.contains("git checkout") && l.contains("main")),
        "branch switch happens"
    );
}

#[tokio::test]
async fn clone_failure_carries_a_hint_and_the_phase() {
    let root = TestRoot::new();
    let path = root.write_habitat(
        "demo",
        r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
repos:
  - url: git@github.com:o/private
    path: ${WORKDIR}/private
"#,
    );
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    runtime.fail_on("git clone", "git@github.com: Permission denied (publickey).");

    let err = Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some("repos"));
    let HabitatError::Phase { source, .. } = err else {
        panic!("expected phase wrapper");
    };
    match *source {
        HabitatError::Repository(habitat_core::errors::RepositoryError::Clone {
            hint, ..
        }) => {
            assert_eq!(hint, habitat_core::errors::CloneHint::PrivateKey);
        }
        other => panic!("expected clone error, got {}", other),
    }

    // Snapshots from completed phases survive the failure.
    assert!(runtime.image_tags().contains(&"habitat-demo:6-files".to_string()));
    assert!(!runtime.image_tags().iter().any(|t| t.contains("7-repos")));
}

#[tokio::test]
async fn verify_failure_aborts_without_a_snapshot() {
    let root = TestRoot::new();
    let path = root.write_habitat(
        "demo",
        r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
verify-fs:
  required_files:
    - ${WORKDIR}/must-exist
"#,
    );
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    runtime.fail_on("test -e /workspace/must-exist", "missing");

    let err = Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some("verify"));
    assert!(!runtime.image_tags().iter().any(|t| t.contains("12-final")));
    assert!(runtime.image_tags().contains(&"habitat-demo:9-scripts".to_string()));
}

#[tokio::test]
async fn interrupt_stops_at_the_phase_boundary() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    let coordinator = CleanupCoordinator::with_peer_probe(|| 0);
    coordinator.record_interrupt();

    let err = Pipeline::new(&runtime, &config, &NullObserver)
        .with_coordinator(&coordinator)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, HabitatError::Interrupted));
    assert!(runtime.image_tags().is_empty());
}

#[tokio::test]
async fn rebuild_ignores_existing_snapshots() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();

    let output = Pipeline::new(&runtime, &config, &NullObserver)
        .with_options(PipelineOptions {
            rebuild: Rebuild::Full,
            ..Default::default()
        })
        .run()
        .await
        .unwrap();
    assert!(!output.cached);
    assert_eq!(output.phases_run.len(), PHASES.len());
}

#[tokio::test]
async fn target_phase_stops_the_walk() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();

    let output = Pipeline::new(&runtime, &config, &NullObserver)
        .with_options(PipelineOptions {
            target: Some("users".to_string()),
            ..Default::default()
        })
        .run()
        .await
        .unwrap();

    assert_eq!(output.phases_run, vec!["base", "users"]);
    assert_eq!(output.image, "habitat-demo:2-users");
    assert!(!runtime.image_tags().iter().any(|t| t.contains("3-env")));
}

#[tokio::test]
async fn env_profile_exports_resolved_variables() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let runtime = RecordingRuntime::new();
    Pipeline::new(&runtime, &config, &NullObserver)
        .run()
        .await
        .unwrap();

    let log = runtime.log();
    let profile_write = log
        .iter()
        .find(|l| l.contains("/etc/profile.d/habitat-env.sh"))
        .expect("env profile written");
    assert!(profile_write.contains("export USER=node"));
    assert!(profile_write.contains("export WORKDIR=/workspace"));
    assert!(profile_write.contains("cd \"$WORKDIR\""));
}
