//! Integration tests for phase hashing: determinism and targeted
//! invalidation

mod common;

use common::{TestRoot, DEMO_CONFIG};
use habitat_core::config::ConfigLoader;
use habitat_core::hasher::{calculate_all, PhaseHasher};
use habitat_core::phases;
use std::fs;

#[test]
fn hashes_are_deterministic_across_loads() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let loader = ConfigLoader::new(root.path());

    let first = calculate_all(&loader, &path, &phases::names()).unwrap();
    let second = calculate_all(&loader, &path, &phases::names()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 12);
    for hash in first.values() {
        assert_eq!(hash.len(), 12);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

#[test]
fn env_addition_invalidates_env_but_not_users() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let loader = ConfigLoader::new(root.path());
    let before = calculate_all(&loader, &path, &phases::names()).unwrap();

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
    let after = calculate_all(&loader, &path, &phases::names()).unwrap();

    assert_eq!(before["base"], after["base"]);
    assert_eq!(before["users"], after["users"]);
    assert_ne!(before["env"], after["env"]);
}

#[test]
fn file_content_change_invalidates_only_files() {
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
  - src: ./a.sh
    dest: /workspace/a.sh
    mode: 755
"#,
    );
    let habitat_dir = root.habitat_dir("demo");
    fs::write(habitat_dir.join("a.sh"), "echo one\n").unwrap();

    let loader = ConfigLoader::new(root.path());
    let before = calculate_all(&loader, &path, &phases::names()).unwrap();

    fs::write(habitat_dir.join("a.sh"), "echo two\n").unwrap();
    let after = calculate_all(&loader, &path, &phases::names()).unwrap();

    assert_ne!(before["files"], after["files"]);
    for name in ["base", "users", "env", "workdir", "habitat", "repos", "scripts", "final"] {
        assert_eq!(before[name], after[name], "{} should be stable", name);
    }
}

#[test]
fn missing_file_source_hashes_stably() {
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
  - src: ./missing.sh
    dest: /workspace/missing.sh
"#,
    );
    let loader = ConfigLoader::new(root.path());
    let first = calculate_all(&loader, &path, &phases::names()).unwrap();
    let second = calculate_all(&loader, &path, &phases::names()).unwrap();
    assert_eq!(first["files"], second["files"]);
}

#[test]
fn repo_fingerprints_use_not_cloned_for_fresh_targets() {
    let root = TestRoot::new();
    let path = root.write_habitat(
        "demo",
        r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/no/such/host/dir
repos:
  - url: https://example.com/x
    path: ${WORKDIR}/x
    branch: main
"#,
    );
    let loader = ConfigLoader::new(root.path());
    // The clone target does not exist on the host, so the fingerprint is
    // the stable "not-cloned" marker and the hash repeats.
    let first = calculate_all(&loader, &path, &phases::names()).unwrap();
    let second = calculate_all(&loader, &path, &phases::names()).unwrap();
    assert_eq!(first["repos"], second["repos"]);
}

#[test]
fn batch_api_rejects_unknown_phases() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let loader = ConfigLoader::new(root.path());
    let err = calculate_all(&loader, &path, &["base", "bogus"]).unwrap_err();
    assert!(err.to_string().contains("Unknown target phase: bogus"));
}

#[test]
fn hash_all_matches_per_phase_hashing() {
    let root = TestRoot::new();
    let path = root.write_habitat("demo", DEMO_CONFIG);
    let config = ConfigLoader::new(root.path()).load(&path).unwrap();
    let hasher = PhaseHasher::new(&config);
    let all = hasher.hash_all();
    for phase in habitat_core::phases::PHASES {
        assert_eq!(all[phase.name], hasher.hash_phase(phase));
    }
}
