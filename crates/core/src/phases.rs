//! Fixed build phase registry
//!
//! The pipeline walks a fixed, ordered table of twelve phases. Each phase
//! names the dotted config paths that feed its hash, and whether a snapshot
//! image is committed when it completes. `verify` and `test` are
//! validation-only and never produce a snapshot.

use crate::errors::{CliError, HabitatError, Result};

/// One entry in the phase registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    /// Stable numeric id, "1".."12"
    pub id: u8,
    /// Phase name used in image tags and labels
    pub name: &'static str,
    /// Short human description for progress output
    pub description: &'static str,
    /// Dotted paths into the coalesced config that feed this phase's hash
    pub config_sections: &'static [&'static str],
    /// Whether a snapshot image is committed after this phase
    pub snapshot: bool,
}

impl Phase {
    /// Image tag suffix for this phase's snapshot, e.g. `12-final`
    pub fn tag_suffix(&self) -> String {
        format!("{}-{}", self.id, self.name)
    }

    /// Label key carrying this phase's hash on snapshot images
    pub fn hash_label(&self) -> String {
        format!("{}.hash", self.name)
    }
}

/// The twelve build phases, order significant
pub const PHASES: &[Phase] = &[
    Phase {
        id: 1,
        name: "base",
        description: "Start the build container from the base image",
        config_sections: &["base_image", "image", "name"],
        snapshot: true,
    },
    Phase {
        id: 2,
        name: "users",
        description: "Create the container user",
        config_sections: &["env.USER", "env.WORKDIR"],
        snapshot: true,
    },
    Phase {
        id: 3,
        name: "env",
        description: "Write the environment profile",
        config_sections: &["env"],
        snapshot: true,
    },
    Phase {
        id: 4,
        name: "workdir",
        description: "Create the working directory",
        config_sections: &[
            "env.WORKDIR",
            "env.HABITAT_PATH",
            "env.SYSTEM_PATH",
            "env.SHARED_PATH",
            "env.LOCAL_PATH",
        ],
        snapshot: true,
    },
    Phase {
        id: 5,
        name: "habitat",
        description: "Create the habitat infrastructure tree",
        config_sections: &[
            "env.HABITAT_PATH",
            "env.SYSTEM_PATH",
            "env.SHARED_PATH",
            "env.LOCAL_PATH",
        ],
        snapshot: true,
    },
    Phase {
        id: 6,
        name: "files",
        description: "Materialize configured files",
        config_sections: &["files", "volumes"],
        snapshot: true,
    },
    Phase {
        id: 7,
        name: "repos",
        description: "Clone configured repositories",
        config_sections: &["repos"],
        snapshot: true,
    },
    Phase {
        id: 8,
        name: "tools",
        description: "Install tools",
        config_sections: &["tools"],
        snapshot: true,
    },
    Phase {
        id: 9,
        name: "scripts",
        description: "Run setup scripts",
        config_sections: &["scripts"],
        snapshot: true,
    },
    Phase {
        id: 10,
        name: "verify",
        description: "Verify required filesystem entries",
        config_sections: &["verify-fs"],
        snapshot: false,
    },
    Phase {
        id: 11,
        name: "test",
        description: "Run configured test scripts",
        config_sections: &["tests"],
        snapshot: false,
    },
    Phase {
        id: 12,
        name: "final",
        description: "Commit the final image",
        config_sections: &["entry"],
        snapshot: true,
    },
];

/// Look up a phase by name
pub fn by_name(name: &str) -> Option<&'static Phase> {
    PHASES.iter().find(|p| p.name == name)
}

/// Zero-based index of a phase by name, or a CLI error naming the phase
pub fn index_of(name: &str) -> Result<usize> {
    PHASES
        .iter()
        .position(|p| p.name == name)
        .ok_or_else(|| {
            HabitatError::Cli(CliError::UnknownPhase {
                name: name.to_string(),
            })
        })
}

/// Names of all phases in registry order
pub fn names() -> Vec<&'static str> {
    PHASES.iter().map(|p| p.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_complete_and_ordered() {
        assert_eq!(PHASES.len(), 12);
        for (i, phase) in PHASES.iter().enumerate() {
            assert_eq!(phase.id as usize, i + 1);
        }
        assert_eq!(PHASES[0].name, "base");
        assert_eq!(PHASES[11].name, "final");
    }

    #[test]
    fn validation_phases_do_not_snapshot() {
        assert!(!by_name("verify").unwrap().snapshot);
        assert!(!by_name("test").unwrap().snapshot);
        assert!(by_name("final").unwrap().snapshot);
    }

    #[test]
    fn unknown_phase_is_a_cli_error() {
        let err = index_of("bogus").unwrap_err();
        assert!(err.to_string().contains("Unknown target phase: bogus"));
    }

    #[test]
    fn tag_and_label_shapes() {
        let phase = by_name("final").unwrap();
        assert_eq!(phase.tag_suffix(), "12-final");
        assert_eq!(phase.hash_label(), "final.hash");
    }
}
