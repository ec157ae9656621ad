//! Error types and handling
//!
//! This module provides domain-specific error types for the habitat build
//! core. Errors raised inside a pipeline phase are wrapped with the phase
//! name before they reach the caller.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },

    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parse { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// A required field is absent after coalescing
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// An `env` entry does not match `KEY=value` with an uppercase key
    #[error("Invalid env entry: {entry:?} (expected KEY=value with uppercase key)")]
    InvalidEnvEntry { entry: String },

    /// A path helper was asked to resolve against an unset variable
    #[error("Environment variable {name} is not set in the coalesced config")]
    UnsetVariable { name: String },
}

/// Container-runtime command failures
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The container engine binary is not on PATH
    #[error("Container runtime not installed or not on PATH")]
    NotInstalled,

    /// A runtime command exited non-zero
    #[error("{kind} failed: {detail}")]
    CommandFailed { kind: String, detail: String },

    /// Runtime output could not be interpreted
    #[error("Unexpected runtime output for {kind}: {detail}")]
    UnexpectedOutput { kind: String, detail: String },
}

/// Hint attached to a categorized clone failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneHint {
    /// Authentication failure; a private key or access token is likely needed
    PrivateKey,
    /// The repository URL does not resolve
    Url,
    /// The requested branch does not exist
    Branch,
    /// No categorization matched
    None,
}

impl CloneHint {
    /// Human-readable remediation line, empty for `None`
    pub fn message(&self) -> &'static str {
        match self {
            CloneHint::PrivateKey => {
                "Hint: the repository rejected our credentials. Configure a deploy key or access token for private repositories."
            }
            CloneHint::Url => "Hint: the repository was not found. Check the URL.",
            CloneHint::Branch => {
                "Hint: the requested branch does not exist. Try the repository's default branch."
            }
            CloneHint::None => "",
        }
    }
}

/// Repository clone / fetch failures
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Cloning a repository inside the build container failed
    #[error("Failed to clone {url}: {detail}")]
    Clone {
        url: String,
        detail: String,
        hint: CloneHint,
    },

    /// A free-form repository spec did not match any supported grammar
    #[error("Invalid repository spec: {spec:?} (expected url[:path[:branch]])")]
    InvalidSpec { spec: String },
}

/// Host filesystem failures during file materialization
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// A file entry's source path does not exist
    #[error("Source path does not exist: {path}")]
    MissingSource { path: String },

    /// Copying a file into the build container failed
    #[error("Failed to copy {path}: {detail}")]
    Copy { path: String, detail: String },
}

/// Malformed invocation parameters
#[derive(Error, Debug)]
pub enum CliError {
    /// `--target` or `--rebuild-from` named a phase that is not in the registry
    #[error("Unknown target phase: {name}")]
    UnknownPhase { name: String },

    /// Invocation parameter failed validation
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

/// Domain errors for the habitat build core
#[derive(Error, Debug)]
pub enum HabitatError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Container runtime errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Repository errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Filesystem errors
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    /// CLI parameter errors
    #[error("Invocation error: {0}")]
    Cli(#[from] CliError),

    /// I/O errors outside any more specific category
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A phase of the pipeline failed; carries the originating error
    #[error("Failed at phase: {phase}: {source}")]
    Phase {
        phase: String,
        #[source]
        source: Box<HabitatError>,
    },

    /// A phase exceeded its configured timeout
    #[error("Phase {phase} timed out after {seconds}s")]
    PhaseTimeout { phase: String, seconds: u64 },

    /// The run was interrupted by the user
    #[error("Interrupted")]
    Interrupted,
}

impl HabitatError {
    /// Wrap this error with the name of the phase it occurred in.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost phase
    /// wins.
    pub fn at_phase(self, phase: &str) -> Self {
        match self {
            HabitatError::Phase { .. } => self,
            other => HabitatError::Phase {
                phase: phase.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The phase name attached to this error, if any
    pub fn phase(&self) -> Option<&str> {
        match self {
            HabitatError::Phase { phase, .. } => Some(phase),
            HabitatError::PhaseTimeout { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

/// Convenience type alias for Results with HabitatError
pub type Result<T> = std::result::Result<T, HabitatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_phase_wraps_once() {
        let err = HabitatError::Runtime(RuntimeError::CommandFailed {
            kind: "exec".to_string(),
            detail: "exit 1".to_string(),
        });
        let wrapped = err.at_phase("repos").at_phase("scripts");
        assert_eq!(wrapped.phase(), Some("repos"));
        let rendered = wrapped.to_string();
        assert!(rendered.starts_with("Failed at phase: repos"));
    }

    #[test]
    fn clone_hint_messages() {
        assert!(CloneHint::PrivateKey.message().contains("deploy key"));
        assert!(CloneHint::None.message().is_empty());
    }
}
