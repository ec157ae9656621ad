//! Console output
//!
//! Progress events render as one line per event; errors render as a kind
//! line, a phase line when one is attached, and a hint or suggestion block
//! where the error carries one.

use console::style;
use habitat_core::errors::{CloneHint, ConfigError, HabitatError, RepositoryError};
use habitat_core::progress::{ProgressEvent, ProgressObserver};

/// Observer that prints progress events to stderr
#[derive(Debug, Default)]
pub struct ConsoleObserver;

impl ProgressObserver for ConsoleObserver {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PhaseBegin { phase, index, .. } => {
                eprintln!("{} [{:>2}/12] {}", style("→").cyan(), index + 1, phase);
            }
            ProgressEvent::PhaseEnd {
                phase,
                duration_ms,
                success,
                ..
            } => {
                if *success {
                    eprintln!(
                        "{} {} ({}ms)",
                        style("✓").green(),
                        phase,
                        duration_ms
                    );
                } else {
                    eprintln!("{} {} failed", style("✗").red(), phase);
                }
            }
            ProgressEvent::SnapshotCreated { image, .. } => {
                eprintln!("  snapshot {}", style(image).dim());
            }
            ProgressEvent::CacheHit { image, .. } => {
                eprintln!("Using cached snapshot: {}", style(image).green());
            }
            ProgressEvent::CacheResume {
                image, start_phase, ..
            } => {
                eprintln!(
                    "Resuming from {} at phase {}",
                    style(image).green(),
                    start_phase
                );
            }
            ProgressEvent::CleanupBegin { .. } => {
                eprintln!("{}", style("Cleaning up...").dim());
            }
            ProgressEvent::CleanupEnd {
                containers_removed,
                images_removed,
                ..
            } => {
                eprintln!(
                    "{}",
                    style(format!(
                        "Cleanup done ({} containers, {} images)",
                        containers_removed, images_removed
                    ))
                    .dim()
                );
            }
        }
    }
}

/// Render an error the way the CLI reports it: kind and summary first, the
/// failing phase second, then any hint or configuration suggestion.
pub fn render_error(err: &HabitatError) -> String {
    let mut out = String::new();
    let (inner, phase) = match err {
        HabitatError::Phase { phase, source } => (source.as_ref(), Some(phase.as_str())),
        other => (other, other.phase()),
    };
    out.push_str(&format!("{}\n", inner));
    if let Some(phase) = phase {
        out.push_str(&format!("Failed at phase: {}\n", phase));
    }
    if let HabitatError::Repository(RepositoryError::Clone { hint, .. }) = inner {
        if *hint != CloneHint::None {
            out.push_str(&format!("{}\n", hint.message()));
        }
    }
    if let HabitatError::Config(config_err) = inner {
        if let Some(suggestion) = config_suggestion(config_err) {
            out.push_str(&suggestion);
        }
    }
    out
}

/// Sample configuration block for the most common config mistakes
fn config_suggestion(err: &ConfigError) -> Option<String> {
    match err {
        ConfigError::MissingField { field } if field.starts_with("env.") => Some(
            "\nAdd an env section to the habitat config, for example:\n\
             \n\
             env:\n\
             \x20 - USER=node\n\
             \x20 - WORKDIR=/workspace\n"
                .to_string(),
        ),
        ConfigError::MissingField { field } if field == "name" => Some(
            "\nEvery habitat config needs a name, for example:\n\
             \n\
             name: my-habitat\n"
                .to_string(),
        ),
        ConfigError::Validation { message } if message.contains("WORKDIR") => Some(
            "\nWORKDIR must be absolute, for example:\n\
             \n\
             env:\n\
             \x20 - WORKDIR=/workspace\n"
                .to_string(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_core::errors::RuntimeError;

    #[test]
    fn renders_phase_context() {
        let err = HabitatError::Runtime(RuntimeError::CommandFailed {
            kind: "exec".to_string(),
            detail: "exit 1".to_string(),
        })
        .at_phase("repos");
        let rendered = render_error(&err);
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("Runtime error: exec failed: exit 1"));
        assert_eq!(lines.next(), Some("Failed at phase: repos"));
    }

    #[test]
    fn renders_clone_hint() {
        let err = HabitatError::Repository(RepositoryError::Clone {
            url: "git@github.com:o/r".to_string(),
            detail: "Permission denied (publickey)".to_string(),
            hint: CloneHint::PrivateKey,
        });
        let rendered = render_error(&err);
        assert!(rendered.contains("Hint:"));
    }

    #[test]
    fn renders_env_suggestion() {
        let err = HabitatError::Config(ConfigError::MissingField {
            field: "env.USER".to_string(),
        });
        let rendered = render_error(&err);
        assert!(rendered.contains("USER=node"));
    }
}
