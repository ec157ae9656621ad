//! Repository spec parsing
//!
//! Extra repositories arrive on the command line as free-form strings in one
//! of three grammars:
//!
//! - SSH: `git@host:owner/repo:path[:branch]`
//! - HTTPS: `https://host/owner/repo:path[:branch]`
//! - bare: `url:path[:branch]`
//!
//! Parsing is pure string splitting; the URL itself is never interpreted
//! beyond locating the path and branch segments. `Display` formats a spec
//! back into the same grammar it was parsed from.

use crate::errors::{CloneHint, RepositoryError, Result};
use serde::{Deserialize, Serialize};

/// A repository to clone into the habitat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Clone URL (SSH or HTTPS or bare)
    pub url: String,
    /// Target path inside the container
    pub path: String,
    /// Branch to check out; `None` means the remote default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl RepoSpec {
    /// Parse a free-form `url[:path[:branch]]` string.
    ///
    /// SSH specs keep their `git@host:owner/repo` prefix intact; the path is
    /// the second colon-delimited segment. HTTPS specs keep `https://…/repo`
    /// intact; path and branch follow after the scheme's authority. A spec
    /// with no recognizable path segment is rejected.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || {
            RepositoryError::InvalidSpec {
                spec: spec.to_string(),
            }
            .into()
        };

        if spec.trim().is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = spec.strip_prefix("git@") {
            // git@host:owner/repo:path[:branch]
            let mut parts = rest.splitn(3, ':');
            let host_and_repo = match (parts.next(), parts.next()) {
                (Some(host), Some(repo)) if !host.is_empty() && !repo.is_empty() => {
                    format!("git@{}:{}", host, repo)
                }
                _ => return Err(invalid()),
            };
            let tail = parts.next().ok_or_else(invalid)?;
            let (path, branch) = split_path_branch(tail).ok_or_else(invalid)?;
            return Ok(Self {
                url: host_and_repo,
                path,
                branch,
            });
        }

        if let Some(rest) = spec.strip_prefix("https://") {
            // https://host/owner/repo:path[:branch]
            let mut parts = rest.splitn(2, ':');
            let authority = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
            let tail = parts.next().ok_or_else(invalid)?;
            let (path, branch) = split_path_branch(tail).ok_or_else(invalid)?;
            return Ok(Self {
                url: format!("https://{}", authority),
                path,
                branch,
            });
        }

        // bare url:path[:branch]
        let mut parts = spec.splitn(2, ':');
        let url = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let tail = parts.next().ok_or_else(invalid)?;
        let (path, branch) = split_path_branch(tail).ok_or_else(invalid)?;
        Ok(Self {
            url: url.to_string(),
            path,
            branch,
        })
    }
}

/// Split `path[:branch]`, rejecting empty paths
fn split_path_branch(tail: &str) -> Option<(String, Option<String>)> {
    let mut parts = tail.splitn(2, ':');
    let path = parts.next().filter(|s| !s.is_empty())?;
    let branch = parts.next().filter(|s| !s.is_empty()).map(String::from);
    Some((path.to_string(), branch))
}

impl std::fmt::Display for RepoSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.url, self.path)?;
        if let Some(branch) = &self.branch {
            write!(f, ":{}", branch)?;
        }
        Ok(())
    }
}

/// Categorize git stderr into a remediation hint.
///
/// Inspection is substring-based: auth failures mention `Permission denied`
/// or `publickey`, missing repositories mention `not found` or
/// `does not exist`, and branch problems mention `branch`.
pub fn categorize_clone_failure(stderr: &str) -> CloneHint {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("publickey") {
        CloneHint::PrivateKey
    } else if lower.contains("not found") || lower.contains("does not exist") {
        CloneHint::Url
    } else if lower.contains("branch") {
        CloneHint::Branch
    } else {
        CloneHint::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_spec() {
        let spec = RepoSpec::parse("git@github.com:owner/repo:/work/repo:main").unwrap();
        assert_eq!(spec.url, "git@github.com:owner/repo");
        assert_eq!(spec.path, "/work/repo");
        assert_eq!(spec.branch.as_deref(), Some("main"));
    }

    #[test]
    fn parses_ssh_spec_without_branch() {
        let spec = RepoSpec::parse("git@github.com:owner/repo:/work/repo").unwrap();
        assert_eq!(spec.url, "git@github.com:owner/repo");
        assert_eq!(spec.path, "/work/repo");
        assert_eq!(spec.branch, None);
    }

    #[test]
    fn parses_https_spec() {
        let spec = RepoSpec::parse("https://github.com/owner/repo:/work/repo:dev").unwrap();
        assert_eq!(spec.url, "https://github.com/owner/repo");
        assert_eq!(spec.path, "/work/repo");
        assert_eq!(spec.branch.as_deref(), Some("dev"));
    }

    #[test]
    fn parses_bare_spec() {
        let spec = RepoSpec::parse("local-mirror/repo.git:/work/repo").unwrap();
        assert_eq!(spec.url, "local-mirror/repo.git");
        assert_eq!(spec.path, "/work/repo");
        assert_eq!(spec.branch, None);
    }

    #[test]
    fn display_round_trips_all_grammars() {
        for raw in [
            "git@github.com:owner/repo:/work/repo:main",
            "git@github.com:owner/repo:/work/repo",
            "https://github.com/owner/repo:/work/repo:dev",
            "local-mirror/repo.git:/work/repo",
        ] {
            let spec = RepoSpec::parse(raw).unwrap();
            assert_eq!(RepoSpec::parse(&spec.to_string()).unwrap(), spec);
            assert_eq!(spec.to_string(), raw);
        }
    }

    #[test]
    fn rejects_missing_path() {
        assert!(RepoSpec::parse("git@github.com:owner/repo").is_err());
        assert!(RepoSpec::parse("https://github.com/owner/repo").is_err());
        assert!(RepoSpec::parse("").is_err());
    }

    #[test]
    fn categorizes_clone_failures() {
        assert_eq!(
            categorize_clone_failure("git@github.com: Permission denied (publickey)."),
            CloneHint::PrivateKey
        );
        assert_eq!(
            categorize_clone_failure("fatal: repository 'x' not found"),
            CloneHint::Url
        );
        assert_eq!(
            categorize_clone_failure("fatal: Remote branch nope not found in upstream"),
            CloneHint::Url
        );
        assert_eq!(
            categorize_clone_failure("error: pathspec 'branch' did not match"),
            CloneHint::Branch
        );
        assert_eq!(categorize_clone_failure("network unreachable"), CloneHint::None);
    }
}
