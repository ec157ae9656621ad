//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A habitats root on disk with optional system/shared tiers and one
/// habitat config
pub struct TestRoot {
    pub dir: TempDir,
}

impl TestRoot {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_tier(&self, tier: &str, content: &str) -> PathBuf {
        let dir = self.path().join(tier);
        fs::create_dir_all(&dir).expect("tier dir");
        let path = dir.join("config.yaml");
        fs::write(&path, content).expect("tier config");
        path
    }

    pub fn write_habitat(&self, name: &str, content: &str) -> PathBuf {
        let dir = self.path().join("habitats").join(name);
        fs::create_dir_all(&dir).expect("habitat dir");
        let path = dir.join("config.yaml");
        fs::write(&path, content).expect("habitat config");
        path
    }

    pub fn habitat_dir(&self, name: &str) -> PathBuf {
        self.path().join("habitats").join(name)
    }
}

/// Minimal habitat config passing validation
pub const DEMO_CONFIG: &str = r#"
name: demo
base_image: ubuntu:22.04
env:
  - USER=node
  - WORKDIR=/workspace
"#;
