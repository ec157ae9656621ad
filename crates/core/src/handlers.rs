//! Per-phase build logic
//!
//! Each phase handler drives the container runtime port; none of them touch
//! the engine directly. Handlers share a [`PhaseCtx`] that owns the build
//! container id and the values accumulated during the run (the container
//! user's home, the ENTRYPOINT change stashed by `final`).
//!
//! Directory copies are planned first and executed second: an iterative
//! walker yields the exact `(src, dest)` sequence with `.habignore`
//! applied, so the plan itself is testable without a runtime.

use crate::config::{CoalescedConfig, FileEntry, ScriptEntry};
use crate::errors::{
    ConfigError, FilesystemError, HabitatError, RepositoryError, Result, RuntimeError,
};
use crate::ignore::IgnoreSet;
use crate::phases::Phase;
use crate::repos::{categorize_clone_failure, RepoSpec};
use crate::runtime::ContainerRuntime;
use crate::snapshot::habitat_prefix;
use crate::variable::Expander;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Mutable state threaded through the phase handlers of one run
pub struct PhaseCtx<'a, R: ContainerRuntime> {
    pub runtime: &'a R,
    pub config: &'a CoalescedConfig,
    /// Build container id; set by the `base` handler or by the pipeline
    /// when resuming from a snapshot
    pub container: Option<String>,
    /// Dockerfile instruction applied at the final snapshot commit
    pub entrypoint_change: Option<String>,
    /// Repositories passed on the command line, cloned after the configured
    /// ones
    pub extra_repos: Vec<RepoSpec>,
    user_home: Option<String>,
}

impl<'a, R: ContainerRuntime> PhaseCtx<'a, R> {
    pub fn new(runtime: &'a R, config: &'a CoalescedConfig, extra_repos: Vec<RepoSpec>) -> Self {
        Self {
            runtime,
            config,
            container: None,
            entrypoint_change: None,
            extra_repos,
            user_home: None,
        }
    }

    fn container(&self) -> Result<&str> {
        self.container.as_deref().ok_or_else(|| {
            RuntimeError::UnexpectedOutput {
                kind: "phase".to_string(),
                detail: "no build container; base phase has not run".to_string(),
            }
            .into()
        })
    }

    async fn exec(&self, cmd: &[&str], user: Option<&str>) -> Result<String> {
        let cmd: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
        self.runtime.exec(self.container()?, &cmd, user).await
    }

    async fn sh(&self, script: &str, user: Option<&str>) -> Result<String> {
        self.exec(&["sh", "-lc", script], user).await
    }

    fn user(&self) -> &str {
        self.config.env_get("USER").unwrap_or("root")
    }

    fn workdir(&self) -> &str {
        self.config.env_get("WORKDIR").unwrap_or("/")
    }

    /// Home directory of the container user, from `/etc/passwd` in the
    /// container, falling back to `/home/<user>`
    async fn user_home(&mut self) -> Result<String> {
        if let Some(home) = &self.user_home {
            return Ok(home.clone());
        }
        let user = self.user().to_string();
        let probed = self
            .sh(&format!("getent passwd {} | cut -d: -f6", user), None)
            .await
            .unwrap_or_default();
        let home = match probed.lines().next().map(str::trim) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ if user == "root" => "/root".to_string(),
            _ => format!("/home/{}", user),
        };
        self.user_home = Some(home.clone());
        Ok(home)
    }

    /// Expand `${VAR}` and a leading `~` in an in-container destination
    async fn expand_dest(&mut self, dest: &str) -> Result<String> {
        let expanded = self.config.expand_env(dest);
        if let Some(rest) = expanded.strip_prefix("~/") {
            let home = self.user_home().await?;
            return Ok(format!("{}/{}", home.trim_end_matches('/'), rest));
        }
        Ok(expanded)
    }
}

/// Dispatch one phase to its handler
pub async fn run_phase<R: ContainerRuntime>(
    ctx: &mut PhaseCtx<'_, R>,
    phase: &Phase,
) -> Result<()> {
    debug!(phase = phase.name, "Running phase handler");
    match phase.name {
        "base" => base(ctx).await,
        "users" => users(ctx).await,
        "env" => env(ctx).await,
        "workdir" => workdir(ctx).await,
        "habitat" => habitat(ctx).await,
        "files" => files(ctx).await,
        "repos" => repos(ctx).await,
        "tools" => tools(ctx).await,
        "scripts" => scripts(ctx).await,
        "verify" => verify(ctx).await,
        "test" => test(ctx).await,
        "final" => finalize(ctx).await,
        other => Err(RuntimeError::UnexpectedOutput {
            kind: "phase".to_string(),
            detail: format!("no handler for phase {}", other),
        }
        .into()),
    }
}

fn unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Expand `${VAR}` and a leading `~` (host home) in a volume spec
pub fn resolve_volume(config: &CoalescedConfig, volume: &str) -> String {
    let expanded = config.expand_env(volume);
    if let Some(rest) = expanded.strip_prefix("~/") {
        if let Some(dirs) = directories_next::UserDirs::new() {
            return format!("{}/{}", dirs.home_dir().display(), rest);
        }
    }
    expanded
}

/// Start the build container from a Dockerfile, a configured base image, or
/// fail when neither is present
async fn base<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let config = ctx.config;
    let dockerfile = config
        .image
        .as_ref()
        .and_then(|i| i.dockerfile.as_ref())
        .map(|d| config.tier_dirs.local.join(d))
        .or_else(|| {
            let local = config.tier_dirs.local.join("Dockerfile");
            local.exists().then_some(local)
        });

    let image = if let Some(dockerfile) = dockerfile {
        let tag = format!("temp-dockerfile-{}", unix_ms());
        let build_args = config
            .image
            .as_ref()
            .map(|i| i.build_args.clone())
            .unwrap_or_default();
        ctx.runtime
            .build_image(&dockerfile, &tag, &build_args, false)
            .await?
    } else if let Some(base_image) = config
        .base_image
        .clone()
        .or_else(|| config.image.as_ref().and_then(|i| i.base.clone()))
    {
        base_image
    } else {
        return Err(ConfigError::MissingField {
            field: "base_image (or image.dockerfile)".to_string(),
        }
        .into());
    };

    let volumes: Vec<String> = config
        .volumes
        .iter()
        .map(|v| resolve_volume(config, v))
        .collect();
    let name = format!("{}-build-{}", habitat_prefix(&config.name), unix_ms());
    let env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let container = ctx
        .runtime
        .run_detached(
            &image,
            Some(&name),
            &env,
            &volumes,
            &["sleep".to_string(), "infinity".to_string()],
        )
        .await?;
    debug!(container = %container, image = %image, "Started build container");
    ctx.container = Some(container);
    Ok(())
}

/// Ensure the configured user exists; group membership is best-effort
async fn users<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let user = ctx.user().to_string();
    if user == "root" {
        return Ok(());
    }
    ctx.sh(
        &format!(
            "id -u {user} >/dev/null 2>&1 || useradd -m -s /bin/bash {user}",
            user = user
        ),
        None,
    )
    .await?;
    if let Err(e) = ctx
        .sh(&format!("usermod -aG sudo,docker {}", user), None)
        .await
    {
        warn!("Could not add {} to sudo,docker groups: {}", user, e);
    }
    Ok(())
}

const ENV_PROFILE: &str = "/etc/profile.d/habitat-env.sh";

/// Write the profile script exporting every resolved variable
async fn env<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let mut script = String::from("# Generated habitat environment\n");
    for (key, value) in &ctx.config.env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str("cd \"$WORKDIR\"\n");
    write_container_file(ctx, ENV_PROFILE, &script, true).await
}

/// Create `$WORKDIR`, owned by the user when not root
async fn workdir<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let workdir = ctx.workdir().to_string();
    let user = ctx.user().to_string();
    ctx.sh(&format!("mkdir -p {}", shell_quote(&workdir)), None)
        .await?;
    if user != "root" {
        ctx.sh(
            &format!("chown {} {}", shell_quote(&user), shell_quote(&workdir)),
            None,
        )
        .await?;
    }
    Ok(())
}

/// Create `$HABITAT_PATH/{system,shared,local}`
async fn habitat<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    if ctx.config.env_get("HABITAT_PATH").is_none() {
        debug!("HABITAT_PATH not set; no infrastructure tree to create");
        return Ok(());
    }
    let user = ctx.user().to_string();
    for tier in ["system", "shared", "local"] {
        let dir = ctx.config.resolve("HABITAT_PATH", &[tier])?;
        ctx.sh(&format!("mkdir -p {}", shell_quote(&dir)), None).await?;
        if user != "root" {
            ctx.sh(
                &format!("chown {} {}", shell_quote(&user), shell_quote(&dir)),
                None,
            )
            .await?;
        }
    }
    Ok(())
}

/// One step of a planned directory copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStep {
    /// Create this directory in the container
    Dir { dest: String },
    /// Copy this host file to this container path
    File { src: PathBuf, dest: String },
}

/// Plan a recursive directory copy with `.habignore` applied.
///
/// The walk is iterative and depth-first in sorted order, so the resulting
/// sequence is deterministic.
pub fn plan_tree_copy(src_root: &Path, dest_root: &str, ignore: &IgnoreSet) -> Result<Vec<CopyStep>> {
    let mut steps = vec![CopyStep::Dir {
        dest: dest_root.trim_end_matches('/').to_string(),
    }];
    let mut stack = vec![src_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();
        for path in entries {
            let relative = path.strip_prefix(src_root).expect("walk stays under root");
            if relative.file_name().and_then(|n| n.to_str()) == Some(".habignore") {
                continue;
            }
            let is_dir = path.is_dir();
            if ignore.matches(relative, is_dir) {
                debug!(path = %relative.display(), "Ignored by .habignore");
                continue;
            }
            let dest = format!(
                "{}/{}",
                dest_root.trim_end_matches('/'),
                relative.display()
            );
            if is_dir {
                steps.push(CopyStep::Dir { dest });
                stack.push(path);
            } else {
                steps.push(CopyStep::File { src: path, dest });
            }
        }
    }
    Ok(steps)
}

/// Execute a copy plan inside the build container
async fn execute_copy_plan<R: ContainerRuntime>(
    ctx: &PhaseCtx<'_, R>,
    steps: &[CopyStep],
    owner: Option<&str>,
    mode: Option<u32>,
) -> Result<()> {
    for step in steps {
        match step {
            CopyStep::Dir { dest } => {
                ctx.sh(&format!("mkdir -p {}", shell_quote(dest)), None).await?;
            }
            CopyStep::File { src, dest } => {
                ctx.runtime
                    .copy_in(ctx.container()?, src, dest)
                    .await
                    .map_err(|e| {
                        HabitatError::Filesystem(FilesystemError::Copy {
                            path: src.display().to_string(),
                            detail: e.to_string(),
                        })
                    })?;
                if let Some(mode) = mode {
                    // mode is written in octal digits in the config
                    ctx.sh(&format!("chmod {} {}", mode, shell_quote(dest)), None)
                        .await?;
                }
            }
        }
    }
    if let Some(owner) = owner {
        if let Some(CopyStep::Dir { dest }) = steps.first() {
            ctx.sh(
                &format!("chown -R {} {}", shell_quote(owner), shell_quote(dest)),
                None,
            )
            .await?;
        }
    }
    Ok(())
}

/// Materialize the habitat tree and the `files` entries scheduled for this
/// phase
async fn files<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    if !ctx.config.entry.bypass_habitat_construction
        && ctx.config.env_get("HABITAT_PATH").is_some()
    {
        let habitat_root = ctx.config.resolve("HABITAT_PATH", &[])?;
        let owner = Some(ctx.user().to_string()).filter(|u| u != "root");
        let tiers = [
            (ctx.config.tier_dirs.system.clone(), "system"),
            (ctx.config.tier_dirs.shared.clone(), "shared"),
            (Some(ctx.config.tier_dirs.local.clone()), "local"),
        ];
        for (dir, tier_name) in tiers {
            let Some(dir) = dir else { continue };
            if !dir.is_dir() {
                continue;
            }
            let ignore = IgnoreSet::load(&dir)?;
            let dest = format!("{}/{}", habitat_root.trim_end_matches('/'), tier_name);
            let steps = plan_tree_copy(&dir, &dest, &ignore)?;
            execute_copy_plan(ctx, &steps, owner.as_deref(), None).await?;
        }
    } else {
        debug!("Skipping habitat tree materialization");
    }

    let entries: Vec<FileEntry> = ctx
        .config
        .files
        .iter()
        .filter(|e| e.before.is_none() && e.after.is_none())
        .cloned()
        .collect();
    for entry in entries {
        apply_file_entry(ctx, &entry).await?;
    }
    Ok(())
}

/// Materialize one file entry (hook or in-phase)
pub async fn apply_file_entry<R: ContainerRuntime>(
    ctx: &mut PhaseCtx<'_, R>,
    entry: &FileEntry,
) -> Result<()> {
    let src = ctx.config.resolve_src(entry);
    if !src.exists() {
        return Err(FilesystemError::MissingSource {
            path: src.display().to_string(),
        }
        .into());
    }
    let dest = ctx.expand_dest(&entry.dest).await?;
    debug!(src = %src.display(), dest = %dest, "Materializing file entry");

    if src.is_dir() {
        let ignore = IgnoreSet::load(&src)?;
        let steps = plan_tree_copy(&src, &dest, &ignore)?;
        execute_copy_plan(ctx, &steps, entry.owner.as_deref(), entry.mode).await?;
        return Ok(());
    }

    if let Some(parent) = Path::new(&dest).parent() {
        let parent = parent.display().to_string();
        if !parent.is_empty() && parent != "/" {
            ctx.sh(&format!("mkdir -p {}", shell_quote(&parent)), None).await?;
            if let Some(owner) = &entry.owner {
                ctx.sh(
                    &format!("chown {} {}", shell_quote(owner), shell_quote(&parent)),
                    None,
                )
                .await?;
            }
        }
    }
    ctx.runtime
        .copy_in(ctx.container()?, &src, &dest)
        .await
        .map_err(|e| {
            HabitatError::Filesystem(FilesystemError::Copy {
                path: src.display().to_string(),
                detail: e.to_string(),
            })
        })?;
    if let Some(mode) = entry.mode {
        ctx.sh(&format!("chmod {} {}", mode, shell_quote(&dest)), None)
            .await?;
    }
    if let Some(owner) = &entry.owner {
        ctx.sh(
            &format!("chown {} {}", shell_quote(owner), shell_quote(&dest)),
            None,
        )
        .await?;
    }
    Ok(())
}

/// Clone configured and extra repositories
async fn repos<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let mut all: Vec<(String, String, Option<String>, bool)> = ctx
        .config
        .repos
        .iter()
        .map(|r| {
            (
                r.url.clone(),
                ctx.config.expand_env(&r.path),
                r.branch.clone(),
                r.shallow.unwrap_or(false),
            )
        })
        .collect();
    all.extend(ctx.extra_repos.iter().map(|r| {
        (
            r.url.clone(),
            ctx.config.expand_env(&r.path),
            r.branch.clone(),
            false,
        )
    }));

    let user = ctx.user().to_string();
    let workdir = ctx.workdir().to_string();
    for (url, path, branch, shallow) in all {
        clone_repo(ctx, &url, &path, branch.as_deref(), shallow, &workdir).await?;
        if user != "root" {
            ctx.sh(
                &format!("chown -R {} {}", shell_quote(&user), shell_quote(&path)),
                None,
            )
            .await?;
        }
    }
    Ok(())
}

async fn clone_repo<R: ContainerRuntime>(
    ctx: &mut PhaseCtx<'_, R>,
    url: &str,
    path: &str,
    branch: Option<&str>,
    shallow: bool,
    workdir: &str,
) -> Result<()> {
    let depth = if shallow { " --depth 1" } else { "" };
    let script = if path == workdir {
        // The working directory may be non-empty (volumes, earlier files);
        // clone next to it and move the contents in.
        let tmp = format!("/tmp/habitat-clone-{}", unix_ms());
        format!(
            "occupied=$(ls -A {path} 2>/dev/null | head -1); \
             if [ -n \"$occupied\" ]; then \
               rm -rf {tmp} && mkdir -p {tmp} && git clone{depth} {url} {tmp} && \
               cp -a {tmp}/. {path}/ && rm -rf {tmp}; \
             else \
               mkdir -p {path} && cd {path} && git clone{depth} {url} .; \
             fi",
            path = shell_quote(path),
            tmp = tmp,
            depth = depth,
            url = shell_quote(url),
        )
    } else {
        format!(
            "rm -rf {path} && mkdir -p {path} && cd {path} && git clone{depth} {url} .",
            path = shell_quote(path),
            depth = depth,
            url = shell_quote(url),
        )
    };
    run_git(ctx, url, &script).await?;
    if let Some(branch) = branch {
        let script = format!(
            "cd {} && git checkout {}",
            shell_quote(path),
            shell_quote(branch)
        );
        run_git(ctx, url, &script).await?;
    }
    Ok(())
}

async fn run_git<R: ContainerRuntime>(
    ctx: &PhaseCtx<'_, R>,
    url: &str,
    script: &str,
) -> Result<()> {
    match ctx.sh(script, None).await {
        Ok(_) => Ok(()),
        Err(HabitatError::Runtime(RuntimeError::CommandFailed { detail, .. })) => {
            let hint = categorize_clone_failure(&detail);
            Err(RepositoryError::Clone {
                url: url.to_string(),
                detail,
                hint,
            }
            .into())
        }
        Err(other) => Err(other),
    }
}

/// Tools arrive through `files`; the phase exists so its hash participates
/// in cache invalidation
async fn tools<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    if !ctx.config.tools.is_empty() {
        debug!(count = ctx.config.tools.len(), "Tools are materialized by file entries");
    }
    Ok(())
}

const ENTRYPOINT: &str = "/entrypoint.sh";

/// Write the entrypoint and run the script entries scheduled for this phase
async fn scripts<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let script = format!(
        "#!/bin/sh\n\
         [ -f {profile} ] && . {profile}\n\
         [ -n \"$PATH\" ] || PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n\
         export PATH\n\
         exec \"$@\"\n",
        profile = ENV_PROFILE
    );
    write_container_file(ctx, ENTRYPOINT, &script, true).await?;

    let entries: Vec<ScriptEntry> = ctx
        .config
        .scripts
        .iter()
        .filter(|e| e.before.is_none() && e.after.is_none())
        .cloned()
        .collect();
    for entry in entries {
        run_script_entry(ctx, &entry).await?;
    }
    Ok(())
}

/// Run one script entry (hook or in-phase). Commands go through the full
/// placeholder grammar, so `{name}`, `{container.*}`, and
/// `{repositories.N.*}` work alongside `${VAR}`.
pub async fn run_script_entry<R: ContainerRuntime>(
    ctx: &mut PhaseCtx<'_, R>,
    entry: &ScriptEntry,
) -> Result<()> {
    let home = ctx.user_home().await.unwrap_or_default();
    let expander = Expander::new(ctx.config)
        .with_container_value("user", ctx.user())
        .with_container_value("home", &home);
    let rendered: Vec<String> = entry
        .commands
        .iter()
        .map(|c| expander.expand_simple(c))
        .collect();
    let user = entry.run_as.clone();
    for command in rendered {
        ctx.sh(&command, user.as_deref()).await?;
    }
    Ok(())
}

/// Check every required filesystem entry; the first missing one aborts
async fn verify<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let required = ctx.config.verify_fs.required_files.clone();
    for path in required {
        let expanded = ctx.config.expand_env(&path);
        if ctx.exec(&["test", "-e", expanded.as_str()], None).await.is_err() {
            return Err(FilesystemError::MissingSource { path: expanded }.into());
        }
    }
    Ok(())
}

/// Run each configured test script as the container user
async fn test<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    let user = ctx.user().to_string();
    let tests = ctx.config.tests.clone();
    for script in tests {
        let path = ctx.config.resolve("WORKDIR", &[script.as_str()])?;
        ctx.sh(&path, Some(&user)).await?;
    }
    Ok(())
}

/// Stash the ENTRYPOINT change for the final snapshot commit
async fn finalize<R: ContainerRuntime>(ctx: &mut PhaseCtx<'_, R>) -> Result<()> {
    ctx.entrypoint_change = Some(format!("ENTRYPOINT [\"{}\"]", ENTRYPOINT));
    Ok(())
}

/// Write a file inside the container via a quoted heredoc; optionally mark
/// it executable
async fn write_container_file<R: ContainerRuntime>(
    ctx: &PhaseCtx<'_, R>,
    path: &str,
    content: &str,
    executable: bool,
) -> Result<()> {
    let chmod = if executable {
        format!(" && chmod +x {}", shell_quote(path))
    } else {
        String::new()
    };
    let script = format!(
        "cat > {path} <<'HABITAT_EOF'\n{content}HABITAT_EOF{chmod}",
        path = shell_quote(path),
        content = content,
        chmod = chmod,
    );
    ctx.sh(&script, None).await?;
    Ok(())
}

/// Minimal single-quote shell quoting
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/_.-:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
