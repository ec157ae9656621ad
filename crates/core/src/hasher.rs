//! Phase hash computation
//!
//! Every phase hashes the subset of the coalesced configuration named by its
//! `config_sections`. The projection is enriched before hashing: `files`
//! entries gain a `contentHash` fingerprint of their source file, `repos`
//! entries gain the current commit and branch of a pre-existing clone
//! target. The enriched projection is serialized as canonical JSON (keys
//! sorted, no whitespace) and hashed with SHA-256; the first 12 hex
//! characters are the phase hash.
//!
//! File reads go through [`ReadOutcome`] so a missing or unreadable source
//! is a stable hash input rather than a failure.

use crate::config::{CoalescedConfig, ConfigLoader};
use crate::errors::Result;
use crate::phases::{self, Phase, PHASES};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Command;
use tracing::{debug, instrument};

/// Outcome of reading a fingerprint source file
#[derive(Debug)]
pub enum ReadOutcome {
    /// File content
    Ok(Vec<u8>),
    /// File does not exist
    NotFound,
    /// Read failed for another reason; carries the error kind
    IoError(String),
}

/// Read a file for fingerprinting; never errors
pub fn read_for_fingerprint(path: &Path) -> ReadOutcome {
    match std::fs::read(path) {
        Ok(bytes) => ReadOutcome::Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReadOutcome::NotFound,
        Err(e) => ReadOutcome::IoError(format!("{:?}", e.kind()).to_lowercase()),
    }
}

/// 12-hex SHA-256 prefix of arbitrary bytes
pub fn short_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// `contentHash` value for one file entry source
fn content_hash(path: &Path) -> String {
    match read_for_fingerprint(path) {
        ReadOutcome::Ok(bytes) => short_digest(&bytes),
        ReadOutcome::NotFound => "error:not-found".to_string(),
        ReadOutcome::IoError(kind) => format!("error:{}", kind),
    }
}

/// Commit and branch of a pre-existing clone target on the build host
#[derive(Debug, Clone, PartialEq, Eq)]
struct RepoFingerprint {
    commit: String,
    branch: String,
}

const NOT_CLONED: &str = "not-cloned";

fn repo_fingerprint(path: &Path) -> RepoFingerprint {
    if !path.is_dir() {
        return RepoFingerprint {
            commit: NOT_CLONED.to_string(),
            branch: NOT_CLONED.to_string(),
        };
    }
    let commit = git_output(path, &["rev-parse", "HEAD"])
        .map(|s| s.chars().take(12).collect())
        .unwrap_or_else(|| NOT_CLONED.to_string());
    let branch = git_output(path, &["rev-parse", "--abbrev-ref", "HEAD"])
        .unwrap_or_else(|| NOT_CLONED.to_string());
    RepoFingerprint { commit, branch }
}

fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!stdout.is_empty()).then_some(stdout)
}

/// Serialize a JSON value with keys sorted and no whitespace
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string serializes"));
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&serde_json::to_string(other).expect("scalar serializes")),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Computes phase hashes over one coalesced config
pub struct PhaseHasher<'a> {
    config: &'a CoalescedConfig,
}

impl<'a> PhaseHasher<'a> {
    pub fn new(config: &'a CoalescedConfig) -> Self {
        Self { config }
    }

    /// Hash for a single phase
    #[instrument(skip(self), fields(phase = phase.name))]
    pub fn hash_phase(&self, phase: &Phase) -> String {
        let projection = self.project(phase);
        let canonical = canonical_json(&projection);
        let hash = short_digest(canonical.as_bytes());
        debug!(hash = %hash, "Computed phase hash");
        hash
    }

    /// Hashes for every phase, in registry order
    pub fn hash_all(&self) -> IndexMap<&'static str, String> {
        PHASES
            .iter()
            .map(|phase| (phase.name, self.hash_phase(phase)))
            .collect()
    }

    /// Projection of the coalesced config onto one phase's sections,
    /// enriched with file and repo fingerprints
    fn project(&self, phase: &Phase) -> Value {
        let mut out = Map::new();
        for section in phase.config_sections {
            select_into(self.config.projection(), section, &mut out);
        }
        if phase.config_sections.contains(&"files") {
            if let Some(Value::Array(entries)) = out.get_mut("files") {
                for (i, entry) in entries.iter_mut().enumerate() {
                    if let Value::Object(map) = entry {
                        let src = self.config.files.get(i).map(|e| self.config.resolve_src(e));
                        if let Some(src) = src {
                            map.insert("contentHash".to_string(), Value::String(content_hash(&src)));
                        }
                    }
                }
            }
        }
        if phase.config_sections.contains(&"repos") {
            if let Some(Value::Array(entries)) = out.get_mut("repos") {
                for (i, entry) in entries.iter_mut().enumerate() {
                    if let Value::Object(map) = entry {
                        let target = self
                            .config
                            .repos
                            .get(i)
                            .map(|r| self.config.expand_env(&r.path));
                        if let Some(target) = target {
                            let fp = repo_fingerprint(Path::new(&target));
                            map.insert("currentCommit".to_string(), Value::String(fp.commit));
                            map.insert("currentBranch".to_string(), Value::String(fp.branch));
                        }
                    }
                }
            }
        }
        Value::Object(out)
    }
}

/// Copy the value at a dotted path from `tree` into `out`, preserving the
/// nesting. Missing paths are omitted.
fn select_into(tree: &Value, dotted: &str, out: &mut Map<String, Value>) {
    let mut parts = dotted.splitn(2, '.');
    let head = match parts.next() {
        Some(h) => h,
        None => return,
    };
    let Some(value) = tree.get(head) else { return };
    match parts.next() {
        None => {
            out.insert(head.to_string(), value.clone());
        }
        Some(rest) => {
            let nested = out
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested) = nested {
                select_into(value, rest, nested);
            }
        }
    }
}

/// Batch API: load the config once and hash the named phases.
///
/// Unknown phase names surface as CLI errors.
pub fn calculate_all(
    loader: &ConfigLoader,
    config_path: &Path,
    phase_names: &[&str],
) -> Result<IndexMap<String, String>> {
    let config = loader.load(config_path)?;
    let hasher = PhaseHasher::new(&config);
    let mut out = IndexMap::new();
    for name in phase_names {
        phases::index_of(name)?;
        let phase = phases::by_name(name).expect("index_of checked");
        out.insert(name.to_string(), hasher.hash_phase(phase));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, 1]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[3,1],"z":true},"b":1}"#);
    }

    #[test]
    fn short_digest_is_12_hex() {
        let digest = short_digest(b"habitat");
        assert_eq!(digest.len(), 12);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn select_into_nested_paths() {
        let tree = json!({"env": {"USER": "node", "WORKDIR": "/w"}, "name": "demo"});
        let mut out = Map::new();
        select_into(&tree, "env.USER", &mut out);
        select_into(&tree, "name", &mut out);
        select_into(&tree, "env.MISSING", &mut out);
        select_into(&tree, "absent", &mut out);
        assert_eq!(
            Value::Object(out),
            json!({"env": {"USER": "node"}, "name": "demo"})
        );
    }

    #[test]
    fn missing_file_is_a_stable_input() {
        assert_eq!(
            content_hash(Path::new("/definitely/not/here.sh")),
            "error:not-found"
        );
    }

    #[test]
    fn uncloned_repo_fingerprint() {
        let fp = repo_fingerprint(Path::new("/definitely/not/a/clone"));
        assert_eq!(fp.commit, NOT_CLONED);
        assert_eq!(fp.branch, NOT_CLONED);
    }
}
