//! `.habignore` handling
//!
//! Each source directory copied into the habitat may carry a `.habignore`
//! file: one glob per line, `#` starts a comment, a trailing `/` restricts
//! the pattern to directories. Patterns match against paths relative to the
//! directory that owns the ignore file.

use crate::errors::Result;
use glob::Pattern;
use std::path::Path;
use tracing::{debug, warn};

/// Parsed ignore patterns for one source directory
#[derive(Debug, Default)]
pub struct IgnoreSet {
    patterns: Vec<IgnorePattern>,
}

#[derive(Debug)]
struct IgnorePattern {
    pattern: Pattern,
    dir_only: bool,
}

impl IgnoreSet {
    /// Load `<dir>/.habignore` if present; an absent file yields an empty set
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(".habignore");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        debug!("Loaded ignore file: {}", path.display());
        Ok(Self::parse(&content))
    }

    /// Parse ignore file content. Unparseable globs are skipped with a warning.
    pub fn parse(content: &str) -> Self {
        let mut patterns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (raw, dir_only) = match line.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (line, false),
            };
            match Pattern::new(raw) {
                Ok(pattern) => patterns.push(IgnorePattern { pattern, dir_only }),
                Err(e) => warn!("Skipping invalid ignore pattern {:?}: {}", line, e),
            }
        }
        Self { patterns }
    }

    /// Whether any patterns were parsed
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `relative` (a path relative to the ignore file's directory)
    /// should be excluded. Patterns also match against the file name alone so
    /// `*.log` excludes logs in subdirectories.
    pub fn matches(&self, relative: &Path, is_dir: bool) -> bool {
        let rel_str = relative.to_string_lossy();
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.patterns.iter().any(|p| {
            if p.dir_only && !is_dir {
                return false;
            }
            p.pattern.matches(&rel_str) || p.pattern.matches(&file_name)
        })
    }
}
