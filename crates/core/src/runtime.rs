//! Container runtime port
//!
//! This module defines the typed interface the pipeline uses to talk to an
//! external container engine, the production `docker`-CLI implementation,
//! and an in-memory recording implementation that makes the pipeline
//! deterministic under test.
//!
//! Every operation returns stdout on success and a
//! [`RuntimeError::CommandFailed`] carrying the command kind and a stderr
//! tail on non-zero exit.

use crate::errors::{Result, RuntimeError};
use indexmap::IndexMap;
use std::path::Path;
use tracing::{debug, instrument};

/// Maximum stderr tail carried in runtime errors
const STDERR_TAIL: usize = 2000;

/// Typed interface over an external container engine
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    /// Build an image from a Dockerfile; returns the tag
    async fn build_image(
        &self,
        dockerfile: &Path,
        tag: &str,
        build_args: &IndexMap<String, String>,
        no_cache: bool,
    ) -> Result<String>;

    /// Start a detached container; returns the container id
    async fn run_detached(
        &self,
        image: &str,
        name: Option<&str>,
        env: &[String],
        volumes: &[String],
        cmd: &[String],
    ) -> Result<String>;

    /// Execute a command in a running container; returns stdout. Stderr is
    /// folded into the output unless it contains only warnings.
    async fn exec(&self, container: &str, cmd: &[String], user: Option<&str>) -> Result<String>;

    /// Commit a container to an image with labels; `change` may set an
    /// ENTRYPOINT instruction
    async fn commit(
        &self,
        container: &str,
        tag: &str,
        labels: &IndexMap<String, String>,
        change: Option<&str>,
    ) -> Result<String>;

    /// Whether an image with this tag exists locally
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Labels of a local image; empty map when the image has none
    async fn image_labels(&self, tag: &str) -> Result<IndexMap<String, String>>;

    /// Stop a container
    async fn stop(&self, container: &str) -> Result<()>;

    /// Force-remove a container
    async fn remove(&self, container: &str) -> Result<()>;

    /// Tag an image under another name
    async fn tag(&self, src: &str, dst: &str) -> Result<()>;

    /// Copy a host path into a container
    async fn copy_in(&self, container: &str, host_path: &Path, container_path: &str)
        -> Result<()>;

    /// Ids of containers (running or stopped) whose names start with the
    /// given prefix
    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>>;

    /// Ids of dangling images
    async fn dangling_images(&self) -> Result<Vec<String>>;

    /// Remove an image by id or tag
    async fn remove_image(&self, image: &str) -> Result<()>;
}

/// Fold stderr into stdout unless every non-empty line is a warning
fn fold_stderr(stdout: String, stderr: &str) -> String {
    let only_warnings = stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .all(|l| {
            let lower = l.trim_start().to_lowercase();
            lower.starts_with("warning") || lower.starts_with("warn")
        });
    if stderr.trim().is_empty() || only_warnings {
        stdout
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{}\n{}", stdout, stderr)
    }
}

fn tail(s: &str) -> String {
    let mut start = s.len().saturating_sub(STDERR_TAIL);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim().to_string()
}

/// CLI-based runtime using the `docker` binary
#[derive(Debug, Clone)]
pub struct CliDocker {
    docker_path: String,
}

impl Default for CliDocker {
    fn default() -> Self {
        Self::new()
    }
}

impl CliDocker {
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
        }
    }

    /// Use a custom engine binary path
    pub fn with_path(docker_path: String) -> Self {
        Self { docker_path }
    }

    /// Run one docker command, mapping non-zero exits to runtime errors
    #[instrument(skip(self, args), fields(kind = kind))]
    async fn run(&self, kind: &str, args: Vec<String>) -> Result<std::process::Output> {
        debug!(command = %args.join(" "), "Running docker command");
        let output = tokio::process::Command::new(&self.docker_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::NotInstalled
                } else {
                    RuntimeError::CommandFailed {
                        kind: kind.to_string(),
                        detail: e.to_string(),
                    }
                }
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CommandFailed {
                kind: kind.to_string(),
                detail: tail(&stderr),
            }
            .into());
        }
        Ok(output)
    }

    async fn run_stdout(&self, kind: &str, args: Vec<String>) -> Result<String> {
        let output = self.run(kind, args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ContainerRuntime for CliDocker {
    async fn build_image(
        &self,
        dockerfile: &Path,
        tag: &str,
        build_args: &IndexMap<String, String>,
        no_cache: bool,
    ) -> Result<String> {
        let context = dockerfile
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .display()
            .to_string();
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            "-t".to_string(),
            tag.to_string(),
        ];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(context);
        self.run("build", args).await?;
        Ok(tag.to_string())
    }

    async fn run_detached(
        &self,
        image: &str,
        name: Option<&str>,
        env: &[String],
        volumes: &[String],
        cmd: &[String],
    ) -> Result<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if let Some(name) = name {
            args.push("--name".to_string());
            args.push(name.to_string());
        }
        for entry in env {
            args.push("-e".to_string());
            args.push(entry.clone());
        }
        for volume in volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        args.push(image.to_string());
        args.extend(cmd.iter().cloned());
        self.run_stdout("run", args).await
    }

    async fn exec(&self, container: &str, cmd: &[String], user: Option<&str>) -> Result<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        args.push(container.to_string());
        args.extend(cmd.iter().cloned());
        let output = self.run("exec", args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(fold_stderr(stdout, &stderr))
    }

    async fn commit(
        &self,
        container: &str,
        tag: &str,
        labels: &IndexMap<String, String>,
        change: Option<&str>,
    ) -> Result<String> {
        let mut args = vec!["commit".to_string()];
        for (key, value) in labels {
            args.push("--change".to_string());
            args.push(format!("LABEL \"{}\"=\"{}\"", key, value));
        }
        if let Some(change) = change {
            args.push("--change".to_string());
            args.push(change.to_string());
        }
        args.push(container.to_string());
        args.push(tag.to_string());
        self.run("commit", args).await?;
        Ok(tag.to_string())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            tag.to_string(),
        ];
        match self.run("image-inspect", args).await {
            Ok(_) => Ok(true),
            Err(crate::errors::HabitatError::Runtime(RuntimeError::CommandFailed {
                detail,
                ..
            })) if detail.contains("No such image") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn image_labels(&self, tag: &str) -> Result<IndexMap<String, String>> {
        let stdout = self
            .run_stdout(
                "image-labels",
                vec![
                    "image".to_string(),
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{json .Config.Labels}}".to_string(),
                    tag.to_string(),
                ],
            )
            .await?;
        if stdout == "null" || stdout.is_empty() {
            return Ok(IndexMap::new());
        }
        serde_json::from_str(&stdout).map_err(|e| {
            RuntimeError::UnexpectedOutput {
                kind: "image-labels".to_string(),
                detail: e.to_string(),
            }
            .into()
        })
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.run("stop", vec!["stop".to_string(), container.to_string()])
            .await?;
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.run(
            "rm",
            vec!["rm".to_string(), "-f".to_string(), container.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn tag(&self, src: &str, dst: &str) -> Result<()> {
        self.run(
            "tag",
            vec!["tag".to_string(), src.to_string(), dst.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn copy_in(
        &self,
        container: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        self.run(
            "cp",
            vec![
                "cp".to_string(),
                host_path.display().to_string(),
                format!("{}:{}", container, container_path),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>> {
        let stdout = self
            .run_stdout(
                "ps",
                vec![
                    "ps".to_string(),
                    "-a".to_string(),
                    "--filter".to_string(),
                    format!("name={}", name_prefix),
                    "--format".to_string(),
                    "{{.ID}}".to_string(),
                ],
            )
            .await?;
        Ok(stdout.lines().map(String::from).collect())
    }

    async fn dangling_images(&self) -> Result<Vec<String>> {
        let stdout = self
            .run_stdout(
                "images",
                vec![
                    "images".to_string(),
                    "-f".to_string(),
                    "dangling=true".to_string(),
                    "-q".to_string(),
                ],
            )
            .await?;
        Ok(stdout.lines().map(String::from).collect())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.run("rmi", vec!["rmi".to_string(), image.to_string()])
            .await?;
        Ok(())
    }
}

/// In-memory runtime that records every operation.
///
/// Images and containers live in maps; `exec` output can be scripted per
/// command substring, and any operation can be made to fail the same way.
/// Tests read back the operation log to assert ordering.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    state: std::sync::Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    images: IndexMap<String, IndexMap<String, String>>,
    containers: IndexMap<String, ContainerRecord>,
    log: Vec<String>,
    exec_scripts: Vec<(String, String)>,
    failures: Vec<(String, String)>,
    next_container: u64,
}

#[derive(Debug, Clone)]
struct ContainerRecord {
    #[allow(dead_code)]
    image: String,
    name: Option<String>,
    running: bool,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an image with labels (a cached snapshot)
    pub fn seed_image(&self, tag: &str, labels: IndexMap<String, String>) {
        self.state
            .lock()
            .expect("runtime lock")
            .images
            .insert(tag.to_string(), labels);
    }

    /// Script `exec` stdout for commands containing the given substring
    pub fn script_exec(&self, needle: &str, stdout: &str) {
        self.state
            .lock()
            .expect("runtime lock")
            .exec_scripts
            .push((needle.to_string(), stdout.to_string()));
    }

    /// Make any operation whose log line contains `needle` fail with the
    /// given stderr detail
    pub fn fail_on(&self, needle: &str, detail: &str) {
        self.state
            .lock()
            .expect("runtime lock")
            .failures
            .push((needle.to_string(), detail.to_string()));
    }

    /// Every recorded operation, in order
    pub fn log(&self) -> Vec<String> {
        self.state.lock().expect("runtime lock").log.clone()
    }

    /// Tags of all known images
    pub fn image_tags(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("runtime lock")
            .images
            .keys()
            .cloned()
            .collect()
    }

    /// Labels of one image, if it exists
    pub fn labels_of(&self, tag: &str) -> Option<IndexMap<String, String>> {
        self.state
            .lock()
            .expect("runtime lock")
            .images
            .get(tag)
            .cloned()
    }

    /// Ids of containers still known to the runtime
    pub fn live_containers(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("runtime lock")
            .containers
            .keys()
            .cloned()
            .collect()
    }

    fn record(&self, kind: &str, line: String) -> Result<()> {
        let mut state = self.state.lock().expect("runtime lock");
        state.log.push(line.clone());
        if let Some((_, detail)) = state.failures.iter().find(|(n, _)| line.contains(n)) {
            return Err(RuntimeError::CommandFailed {
                kind: kind.to_string(),
                detail: detail.clone(),
            }
            .into());
        }
        Ok(())
    }
}

impl ContainerRuntime for RecordingRuntime {
    async fn build_image(
        &self,
        dockerfile: &Path,
        tag: &str,
        _build_args: &IndexMap<String, String>,
        _no_cache: bool,
    ) -> Result<String> {
        self.record("build", format!("build {} {}", dockerfile.display(), tag))?;
        self.state
            .lock()
            .expect("runtime lock")
            .images
            .insert(tag.to_string(), IndexMap::new());
        Ok(tag.to_string())
    }

    async fn run_detached(
        &self,
        image: &str,
        name: Option<&str>,
        _env: &[String],
        volumes: &[String],
        cmd: &[String],
    ) -> Result<String> {
        self.record(
            "run",
            format!(
                "run {} name={} volumes={} cmd={}",
                image,
                name.unwrap_or("-"),
                volumes.join(","),
                cmd.join(" ")
            ),
        )?;
        let mut state = self.state.lock().expect("runtime lock");
        state.next_container += 1;
        let id = format!("container-{}", state.next_container);
        state.containers.insert(
            id.clone(),
            ContainerRecord {
                image: image.to_string(),
                name: name.map(String::from),
                running: true,
            },
        );
        Ok(id)
    }

    async fn exec(&self, container: &str, cmd: &[String], user: Option<&str>) -> Result<String> {
        let line = format!(
            "exec {} user={} {}",
            container,
            user.unwrap_or("-"),
            cmd.join(" ")
        );
        self.record("exec", line.clone())?;
        let state = self.state.lock().expect("runtime lock");
        Ok(state
            .exec_scripts
            .iter()
            .find(|(needle, _)| line.contains(needle))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default())
    }

    async fn commit(
        &self,
        container: &str,
        tag: &str,
        labels: &IndexMap<String, String>,
        change: Option<&str>,
    ) -> Result<String> {
        self.record(
            "commit",
            format!("commit {} {} change={}", container, tag, change.unwrap_or("-")),
        )?;
        self.state
            .lock()
            .expect("runtime lock")
            .images
            .insert(tag.to_string(), labels.clone());
        Ok(tag.to_string())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .expect("runtime lock")
            .images
            .contains_key(tag))
    }

    async fn image_labels(&self, tag: &str) -> Result<IndexMap<String, String>> {
        Ok(self
            .state
            .lock()
            .expect("runtime lock")
            .images
            .get(tag)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.record("stop", format!("stop {}", container))?;
        if let Some(record) = self
            .state
            .lock()
            .expect("runtime lock")
            .containers
            .get_mut(container)
        {
            record.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.record("rm", format!("rm {}", container))?;
        self.state
            .lock()
            .expect("runtime lock")
            .containers
            .shift_remove(container);
        Ok(())
    }

    async fn tag(&self, src: &str, dst: &str) -> Result<()> {
        self.record("tag", format!("tag {} {}", src, dst))?;
        let mut state = self.state.lock().expect("runtime lock");
        let labels = state.images.get(src).cloned().unwrap_or_default();
        state.images.insert(dst.to_string(), labels);
        Ok(())
    }

    async fn copy_in(
        &self,
        container: &str,
        host_path: &Path,
        container_path: &str,
    ) -> Result<()> {
        self.record(
            "cp",
            format!("cp {} {}:{}", host_path.display(), container, container_path),
        )?;
        Ok(())
    }

    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("runtime lock");
        Ok(state
            .containers
            .iter()
            .filter(|(_, r)| {
                r.name
                    .as_deref()
                    .is_some_and(|n| n.starts_with(name_prefix))
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn dangling_images(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.record("rmi", format!("rmi {}", image))?;
        self.state
            .lock()
            .expect("runtime lock")
            .images
            .shift_remove(image);
        Ok(())
    }
}
