//! Persisted invocation state
//!
//! A single-line `.last-used-config` file next to the habitats root records
//! the config of the last habitat that started successfully. Writes are
//! best-effort and readers tolerate absence or garbage.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LAST_USED_FILE: &str = ".last-used-config";

/// Record the last successfully started habitat config. Failures are
/// logged, never surfaced.
pub fn record_last_used(root: &Path, config_path: &Path) {
    let file = root.join(LAST_USED_FILE);
    let line = format!("{}\n", config_path.display());
    if let Err(e) = std::fs::write(&file, line) {
        warn!("Could not record last-used config: {}", e);
    } else {
        debug!(path = %config_path.display(), "Recorded last-used config");
    }
}

/// Path recorded by the previous successful start, if any
pub fn last_used(root: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(root.join(LAST_USED_FILE)).ok()?;
    let line = content.lines().next()?.trim();
    (!line.is_empty()).then(|| PathBuf::from(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_last_used() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(last_used(dir.path()), None);
        record_last_used(dir.path(), Path::new("habitats/demo/config.yaml"));
        assert_eq!(
            last_used(dir.path()),
            Some(PathBuf::from("habitats/demo/config.yaml"))
        );
    }

    #[test]
    fn tolerates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LAST_USED_FILE), "\n").unwrap();
        assert_eq!(last_used(dir.path()), None);
    }
}
