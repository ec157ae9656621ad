//! Configuration loading and coalescing
//!
//! A habitat is described by three YAML tiers sharing one schema: the system
//! base, shared user preferences, and the habitat's own config. Tiers are
//! merged in order `system -> shared -> local`; scalars and lists are
//! replaced at the same path, while `env` is merged key-wise by parsing its
//! `KEY=value` entries and letting later tiers win.
//!
//! The coalesced result is immutable for the rest of the invocation. It
//! carries the resolved environment map (forward references expanded), the
//! origin tier of every top-level field for diagnostics, and a canonical
//! JSON projection tree that feeds the phase hasher.

use crate::errors::{ConfigError, HabitatError, Result};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Top-level keys recognized by the schema; anything else is unknown
const KNOWN_KEYS: &[&str] = &[
    "name",
    "description",
    "base_image",
    "image",
    "env",
    "repos",
    "repositories",
    "files",
    "scripts",
    "volumes",
    "tools",
    "verify-fs",
    "tests",
    "entry",
    "timeout",
];

/// Default per-phase timeout when neither the phase nor `per-phase` is set
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(120);

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap());
static ENV_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").unwrap());
static ENV_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Which tier a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    System,
    Shared,
    Local,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::System => write!(f, "system"),
            Tier::Shared => write!(f, "shared"),
            Tier::Local => write!(f, "local"),
        }
    }
}

/// `image:` block of a tier
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub build_args: IndexMap<String, String>,
}

/// One `files:` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub src: String,
    pub dest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Run this entry before the named phase instead of during `files`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    /// Run this entry after the named phase instead of during `files`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// One `scripts:` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// One `repos:` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub url: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shallow: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

/// `verify-fs:` block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerifyFs {
    #[serde(default)]
    pub required_files: Vec<String>,
}

/// `entry:` block controlling the final phase
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_delay: Option<f64>,
    #[serde(default)]
    pub bypass_habitat_construction: bool,
}

/// Per-phase timeout table
#[derive(Debug, Clone, Default)]
pub struct TimeoutConfig {
    entries: IndexMap<String, Duration>,
}

impl TimeoutConfig {
    /// Resolve a phase's timeout: phase-specific, then the `per-phase`
    /// default, then the system default of 120s.
    pub fn for_phase(&self, phase: &str) -> Duration {
        self.entries
            .get(phase)
            .or_else(|| self.entries.get("per-phase"))
            .copied()
            .unwrap_or(DEFAULT_PHASE_TIMEOUT)
    }
}

/// Directories the three tiers were loaded from; `src` entries starting with
/// `./` resolve against the tier that declared them
#[derive(Debug, Clone, Default)]
pub struct TierDirs {
    pub system: Option<PathBuf>,
    pub shared: Option<PathBuf>,
    pub local: PathBuf,
}

impl TierDirs {
    /// Directory for a tier, falling back to the local dir when the tier
    /// was never loaded
    pub fn dir(&self, tier: Tier) -> &Path {
        match tier {
            Tier::System => self.system.as_deref().unwrap_or(&self.local),
            Tier::Shared => self.shared.as_deref().unwrap_or(&self.local),
            Tier::Local => &self.local,
        }
    }
}

/// The merged, validated, environment-resolved configuration
#[derive(Debug, Clone)]
pub struct CoalescedConfig {
    pub name: String,
    pub description: Option<String>,
    pub base_image: Option<String>,
    pub image: Option<ImageConfig>,
    /// Resolved environment in declaration order
    pub env: IndexMap<String, String>,
    pub files: Vec<FileEntry>,
    pub scripts: Vec<ScriptEntry>,
    pub repos: Vec<RepoEntry>,
    pub volumes: Vec<String>,
    pub tools: Vec<String>,
    pub verify_fs: VerifyFs,
    pub tests: Vec<String>,
    pub entry: EntryConfig,
    pub timeouts: TimeoutConfig,
    /// Origin tier per top-level key (diagnostics only, never hashed)
    pub origins: IndexMap<String, Tier>,
    /// Origin tier per env key
    pub env_origins: IndexMap<String, Tier>,
    pub tier_dirs: TierDirs,
    projection: serde_json::Value,
}

impl CoalescedConfig {
    /// The canonical JSON tree the phase hasher projects from. `env` appears
    /// as the resolved key/value map; everything else mirrors the merged
    /// tiers.
    pub fn projection(&self) -> &serde_json::Value {
        &self.projection
    }

    /// Resolved value of an env variable
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|s| s.as_str())
    }

    /// POSIX-join `env[var]` with extra path segments. Errors if `var` is
    /// unset; there are no defaults.
    pub fn resolve(&self, var: &str, segments: &[&str]) -> Result<String> {
        let base = self.env.get(var).ok_or_else(|| {
            HabitatError::Config(ConfigError::UnsetVariable {
                name: var.to_string(),
            })
        })?;
        let mut joined = base.trim_end_matches('/').to_string();
        for segment in segments {
            joined.push('/');
            joined.push_str(segment.trim_matches('/'));
        }
        Ok(joined)
    }

    /// Expand `${VAR}` references in a string against the resolved
    /// environment; unknown variables are preserved verbatim.
    pub fn expand_env(&self, input: &str) -> String {
        ENV_REF_RE
            .replace_all(input, |caps: &regex::Captures<'_>| {
                match self.env.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Absolute host path of a file entry's `src`, resolved against the tier
    /// the `files` list came from (`./` prefix), the host home (`~/`), or
    /// taken as-is when absolute.
    pub fn resolve_src(&self, entry: &FileEntry) -> PathBuf {
        let src = &entry.src;
        if let Some(rest) = src.strip_prefix("~/") {
            if let Some(dirs) = directories_next::UserDirs::new() {
                return dirs.home_dir().join(rest);
            }
        }
        let path = Path::new(src);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let tier = self.origins.get("files").copied().unwrap_or(Tier::Local);
        self.tier_dirs
            .dir(tier)
            .join(src.strip_prefix("./").unwrap_or(src))
    }
}

/// Loader options and well-known tier paths
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
    strict: bool,
}

impl ConfigLoader {
    /// Create a loader rooted at the habitats directory tree. The system and
    /// shared tiers are read from `<root>/system/config.yaml` and
    /// `<root>/shared/config.yaml`; either may be absent.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            strict: false,
        }
    }

    /// Fail on unknown top-level keys instead of warning
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Resolve a habitat name or explicit path to its config file. A bare
    /// name maps to `<root>/habitats/<name>/config.yaml`; anything with a
    /// path separator or a `.yaml` suffix is used as-is.
    pub fn habitat_config_path(&self, name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.ends_with(".yaml") {
            PathBuf::from(name_or_path)
        } else {
            self.root
                .join("habitats")
                .join(name_or_path)
                .join("config.yaml")
        }
    }

    /// Load and coalesce the three tiers for the given habitat config path
    #[instrument(skip(self))]
    pub fn load(&self, habitat_config: &Path) -> Result<CoalescedConfig> {
        let system_path = self.root.join("system").join("config.yaml");
        let shared_path = self.root.join("shared").join("config.yaml");

        if !habitat_config.exists() {
            return Err(HabitatError::Config(ConfigError::NotFound {
                path: habitat_config.display().to_string(),
            }));
        }

        let system = self.load_tier(&system_path, Tier::System)?;
        let shared = self.load_tier(&shared_path, Tier::Shared)?;
        let local = self.load_tier(habitat_config, Tier::Local)?;
        debug!(
            system = system.is_some(),
            shared = shared.is_some(),
            "Loaded configuration tiers"
        );

        let tier_dirs = TierDirs {
            system: system
                .is_some()
                .then(|| system_path.parent().unwrap().to_path_buf()),
            shared: shared
                .is_some()
                .then(|| shared_path.parent().unwrap().to_path_buf()),
            local: habitat_config
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf(),
        };

        let tiers = [
            (Tier::System, system),
            (Tier::Shared, shared),
            (Tier::Local, local),
        ];
        coalesce(tiers, tier_dirs)
    }

    /// Parse one tier file into a YAML mapping; absent system/shared tiers
    /// yield `None`
    fn load_tier(&self, path: &Path, tier: Tier) -> Result<Option<serde_yaml::Mapping>> {
        if !path.exists() {
            if tier == Tier::Local {
                return Err(HabitatError::Config(ConfigError::NotFound {
                    path: path.display().to_string(),
                }));
            }
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| {
                HabitatError::Config(ConfigError::Parse {
                    message: format!("{}: {}", path.display(), e),
                })
            })?;
        let mapping = match value {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            other => {
                return Err(HabitatError::Config(ConfigError::Parse {
                    message: format!(
                        "{}: expected a mapping at the top level, got {}",
                        path.display(),
                        yaml_type_name(&other)
                    ),
                }))
            }
        };
        for key in mapping.keys() {
            let key_str = key.as_str().unwrap_or_default();
            if !KNOWN_KEYS.contains(&key_str) {
                if self.strict {
                    return Err(HabitatError::Config(ConfigError::Validation {
                        message: format!("Unknown top-level key {:?} in {}", key_str, path.display()),
                    }));
                }
                warn!(tier = %tier, key = key_str, "Ignoring unknown top-level key");
            }
        }
        Ok(Some(mapping))
    }
}

fn yaml_type_name(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

/// Merge tiers and resolve the environment.
///
/// Scalars and lists are replaced wholesale at the same top-level path;
/// `env` is merged key-wise in declaration order with later tiers winning.
/// A later tier's self-reference (`X=${X}:...`) resolves against the
/// previous layer's value for `X`, or empty string at the first layer.
fn coalesce(
    tiers: [(Tier, Option<serde_yaml::Mapping>); 3],
    tier_dirs: TierDirs,
) -> Result<CoalescedConfig> {
    let mut merged: IndexMap<String, serde_yaml::Value> = IndexMap::new();
    let mut origins: IndexMap<String, Tier> = IndexMap::new();
    let mut env: IndexMap<String, String> = IndexMap::new();
    let mut env_origins: IndexMap<String, Tier> = IndexMap::new();

    for (tier, mapping) in tiers {
        let Some(mapping) = mapping else { continue };
        for (key, value) in mapping {
            let Some(key) = key.as_str().map(String::from) else {
                continue;
            };
            if key == "env" {
                merge_env_tier(&value, tier, &mut env, &mut env_origins)?;
                origins.insert("env".to_string(), tier);
                continue;
            }
            // `repositories` is an accepted alias for `repos`
            let key = if key == "repositories" {
                "repos".to_string()
            } else {
                key
            };
            if KNOWN_KEYS.contains(&key.as_str()) {
                origins.insert(key.clone(), tier);
                merged.insert(key, value);
            }
        }
    }

    let resolved_env = resolve_environment(&env)?;

    // Deserialize the merged scalar/list fields into their typed forms
    let name = match merged.get("name").and_then(|v| v.as_str()) {
        Some(name) => name.to_string(),
        None => {
            return Err(HabitatError::Config(ConfigError::MissingField {
                field: "name".to_string(),
            }))
        }
    };
    if !NAME_RE.is_match(&name) {
        return Err(HabitatError::Config(ConfigError::Validation {
            message: format!("Invalid habitat name {:?} (expected ^[a-z][a-z0-9-]*$)", name),
        }));
    }

    let description = merged
        .get("description")
        .and_then(|v| v.as_str())
        .map(String::from);
    let base_image = merged
        .get("base_image")
        .and_then(|v| v.as_str())
        .map(String::from);
    let image: Option<ImageConfig> = typed_field(&merged, "image")?;
    let files: Vec<FileEntry> = typed_field(&merged, "files")?.unwrap_or_default();
    let scripts: Vec<ScriptEntry> = typed_field(&merged, "scripts")?.unwrap_or_default();
    let repos: Vec<RepoEntry> = typed_field(&merged, "repos")?.unwrap_or_default();
    let volumes: Vec<String> = typed_field(&merged, "volumes")?.unwrap_or_default();
    let tools: Vec<String> = typed_field(&merged, "tools")?.unwrap_or_default();
    let verify_fs: VerifyFs = typed_field(&merged, "verify-fs")?.unwrap_or_default();
    let tests: Vec<String> = typed_field(&merged, "tests")?.unwrap_or_default();
    let entry: EntryConfig = typed_field(&merged, "entry")?.unwrap_or_default();
    let timeouts = parse_timeouts(merged.get("timeout"))?;

    validate_hooks(&files, &scripts)?;

    // USER and WORKDIR are mandatory and WORKDIR must be absolute
    if resolved_env.get("USER").is_none() {
        return Err(HabitatError::Config(ConfigError::MissingField {
            field: "env.USER".to_string(),
        }));
    }
    match resolved_env.get("WORKDIR") {
        None => {
            return Err(HabitatError::Config(ConfigError::MissingField {
                field: "env.WORKDIR".to_string(),
            }))
        }
        Some(workdir) if !workdir.starts_with('/') => {
            return Err(HabitatError::Config(ConfigError::Validation {
                message: format!("WORKDIR must be an absolute path, got {:?}", workdir),
            }))
        }
        Some(_) => {}
    }

    let projection = build_projection(
        &name,
        &base_image,
        &image,
        &resolved_env,
        &files,
        &scripts,
        &repos,
        &volumes,
        &tools,
        &verify_fs,
        &tests,
        &entry,
    );

    Ok(CoalescedConfig {
        name,
        description,
        base_image,
        image,
        env: resolved_env,
        files,
        scripts,
        repos,
        volumes,
        tools,
        verify_fs,
        tests,
        entry,
        timeouts,
        origins,
        env_origins,
        tier_dirs,
        projection,
    })
}

/// Deserialize one merged field, mapping serde failures to validation errors
fn typed_field<T: serde::de::DeserializeOwned>(
    merged: &IndexMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<Option<T>> {
    match merged.get(key) {
        None => Ok(None),
        Some(value) => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|e| {
                HabitatError::Config(ConfigError::Validation {
                    message: format!("Invalid {:?} section: {}", key, e),
                })
            }),
    }
}

/// Merge one tier's `env` list into the accumulated key-wise map
fn merge_env_tier(
    value: &serde_yaml::Value,
    tier: Tier,
    env: &mut IndexMap<String, String>,
    env_origins: &mut IndexMap<String, Tier>,
) -> Result<()> {
    let entries = value.as_sequence().ok_or_else(|| {
        HabitatError::Config(ConfigError::Validation {
            message: "env must be a list of KEY=value strings".to_string(),
        })
    })?;
    for entry in entries {
        let entry = entry.as_str().ok_or_else(|| {
            HabitatError::Config(ConfigError::InvalidEnvEntry {
                entry: format!("{:?}", entry),
            })
        })?;
        let (key, raw_value) = parse_env_entry(entry)?;
        // A self-reference resolves against the previous layer's value for
        // this key, or empty string at the first layer.
        let previous = env.get(&key).cloned().unwrap_or_default();
        let token = format!("${{{}}}", key);
        let value = raw_value.replace(&token, &previous);
        env.insert(key.clone(), value);
        env_origins.insert(key, tier);
    }
    Ok(())
}

/// Split a `KEY=value` env entry, enforcing the uppercase key grammar
pub fn parse_env_entry(entry: &str) -> Result<(String, String)> {
    let Some((key, value)) = entry.split_once('=') else {
        return Err(HabitatError::Config(ConfigError::InvalidEnvEntry {
            entry: entry.to_string(),
        }));
    };
    if !ENV_KEY_RE.is_match(key) {
        return Err(HabitatError::Config(ConfigError::InvalidEnvEntry {
            entry: entry.to_string(),
        }));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Expand `${VAR}` references across the merged env map.
///
/// Substitution runs in declaration order for up to N passes (N = number of
/// entries) so forward references settle. After the passes, any remaining
/// reference to a key that IS in the map is circular and rejected;
/// references to unknown names are preserved verbatim (they may be
/// container-runtime variables).
fn resolve_environment(env: &IndexMap<String, String>) -> Result<IndexMap<String, String>> {
    let mut resolved = env.clone();
    let passes = resolved.len().max(1);
    for _ in 0..passes {
        let mut changed = false;
        let snapshot = resolved.clone();
        for value in resolved.values_mut() {
            let replaced = ENV_REF_RE
                .replace_all(value, |caps: &regex::Captures<'_>| {
                    match snapshot.get(&caps[1]) {
                        Some(v) => v.clone(),
                        None => caps[0].to_string(),
                    }
                })
                .into_owned();
            if replaced != *value {
                *value = replaced;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    for (key, value) in &resolved {
        for caps in ENV_REF_RE.captures_iter(value) {
            if resolved.contains_key(&caps[1]) {
                return Err(HabitatError::Config(ConfigError::Validation {
                    message: format!(
                        "Unresolvable env reference ${{{}}} in {} (circular)",
                        &caps[1], key
                    ),
                }));
            }
        }
    }
    Ok(resolved)
}

/// An entry may schedule itself around at most one phase
fn validate_hooks(files: &[FileEntry], scripts: &[ScriptEntry]) -> Result<()> {
    for entry in files {
        if entry.before.is_some() && entry.after.is_some() {
            return Err(HabitatError::Config(ConfigError::Validation {
                message: format!(
                    "File entry {:?} sets both before and after; pick one",
                    entry.src
                ),
            }));
        }
    }
    for entry in scripts {
        if entry.before.is_some() && entry.after.is_some() {
            return Err(HabitatError::Config(ConfigError::Validation {
                message: "Script entry sets both before and after; pick one".to_string(),
            }));
        }
    }
    Ok(())
}

fn parse_timeouts(value: Option<&serde_yaml::Value>) -> Result<TimeoutConfig> {
    let mut entries = IndexMap::new();
    if let Some(mapping) = value.and_then(|v| v.as_mapping()) {
        for (key, value) in mapping {
            let Some(key) = key.as_str() else { continue };
            let duration = match value {
                serde_yaml::Value::Number(n) => n
                    .as_u64()
                    .map(Duration::from_millis)
                    .ok_or_else(|| invalid_timeout(key, &format!("{:?}", n)))?,
                serde_yaml::Value::String(s) => parse_duration(s)
                    .ok_or_else(|| invalid_timeout(key, s))?,
                other => return Err(invalid_timeout(key, &format!("{:?}", other))),
            };
            entries.insert(key.to_string(), duration);
        }
    }
    Ok(TimeoutConfig { entries })
}

fn invalid_timeout(key: &str, value: &str) -> HabitatError {
    HabitatError::Config(ConfigError::Validation {
        message: format!("Invalid timeout for {:?}: {}", key, value),
    })
}

/// Parse a duration literal: `30s`, `2m`, `1h`, `1d`, `500ms`, or a plain
/// integer meaning milliseconds
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(millis) = input.parse::<u64>() {
        return Some(Duration::from_millis(millis));
    }
    let (digits, suffix) = input.split_at(input.find(|c: char| !c.is_ascii_digit())?);
    let amount: u64 = digits.parse().ok()?;
    match suffix {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        "h" => Some(Duration::from_secs(amount * 3600)),
        "d" => Some(Duration::from_secs(amount * 86400)),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_projection(
    name: &str,
    base_image: &Option<String>,
    image: &Option<ImageConfig>,
    env: &IndexMap<String, String>,
    files: &[FileEntry],
    scripts: &[ScriptEntry],
    repos: &[RepoEntry],
    volumes: &[String],
    tools: &[String],
    verify_fs: &VerifyFs,
    tests: &[String],
    entry: &EntryConfig,
) -> serde_json::Value {
    use serde_json::{json, Map, Value};
    let mut tree = Map::new();
    tree.insert("name".to_string(), json!(name));
    if let Some(base_image) = base_image {
        tree.insert("base_image".to_string(), json!(base_image));
    }
    if let Some(image) = image {
        tree.insert("image".to_string(), serde_json::to_value(image).unwrap_or(Value::Null));
    }
    let env_map: Map<String, Value> = env
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    tree.insert("env".to_string(), Value::Object(env_map));
    tree.insert("files".to_string(), serde_json::to_value(files).unwrap_or_default());
    tree.insert("scripts".to_string(), serde_json::to_value(scripts).unwrap_or_default());
    tree.insert("repos".to_string(), serde_json::to_value(repos).unwrap_or_default());
    tree.insert("volumes".to_string(), json!(volumes));
    tree.insert("tools".to_string(), json!(tools));
    tree.insert(
        "verify-fs".to_string(),
        serde_json::to_value(verify_fs).unwrap_or_default(),
    );
    tree.insert("tests".to_string(), json!(tests));
    tree.insert("entry".to_string(), serde_json::to_value(entry).unwrap_or_default());
    Value::Object(tree)
}
