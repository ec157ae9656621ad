//! Template placeholder expansion
//!
//! Phase handlers render strings containing placeholders against the
//! coalesced configuration. One grammar, three production rules:
//!
//! - `${X}`: resolved environment variable
//! - `{a.b.c}`: address-by-path into the coalesced tree (`{name}`,
//!   `{env.X}`, `{image.tag}`, `{repositories.N.field}`)
//! - `{container.*}`: values supplied by the running pipeline (user, home,
//!   container id)
//!
//! Unknown placeholders are preserved verbatim, never an error. Hashing
//! never goes through this module.

use crate::config::CoalescedConfig;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\{([A-Za-z][A-Za-z0-9_.-]*)\}").unwrap());

/// Values the pipeline contributes under the `container.` prefix
pub type ContainerValues = IndexMap<String, String>;

/// Report of placeholder expansions performed
#[derive(Debug, Clone, Default)]
pub struct ExpansionReport {
    /// Placeholder -> resolved value
    pub replacements: IndexMap<String, String>,
    /// Placeholders left verbatim
    pub unknown: Vec<String>,
}

/// Expansion context over one coalesced config
pub struct Expander<'a> {
    config: &'a CoalescedConfig,
    container: ContainerValues,
}

impl<'a> Expander<'a> {
    pub fn new(config: &'a CoalescedConfig) -> Self {
        Self {
            config,
            container: ContainerValues::new(),
        }
    }

    /// Attach a `container.<key>` value
    pub fn with_container_value(mut self, key: &str, value: &str) -> Self {
        self.container.insert(key.to_string(), value.to_string());
        self
    }

    /// Expand every placeholder in `input`, recording what happened
    pub fn expand(&self, input: &str, report: &mut ExpansionReport) -> String {
        TOKEN_RE
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let resolved = if let Some(env_name) = caps.get(1) {
                    self.config.env_get(env_name.as_str()).map(String::from)
                } else {
                    caps.get(2).and_then(|path| self.address(path.as_str()))
                };
                match resolved {
                    Some(value) => {
                        report
                            .replacements
                            .insert(caps[0].to_string(), value.clone());
                        value
                    }
                    None => {
                        report.unknown.push(caps[0].to_string());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    /// Expand without collecting a report
    pub fn expand_simple(&self, input: &str) -> String {
        let mut report = ExpansionReport::default();
        self.expand(input, &mut report)
    }

    /// Resolve a dotted path against the coalesced tree
    fn address(&self, path: &str) -> Option<String> {
        let mut parts = path.splitn(2, '.');
        let head = parts.next()?;
        let rest = parts.next();
        match (head, rest) {
            ("name", None) => Some(self.config.name.clone()),
            ("env", Some(key)) => self.config.env_get(key).map(String::from),
            ("image", Some("tag")) => self
                .config
                .image
                .as_ref()
                .and_then(|i| i.tag.clone())
                .or_else(|| Some(format!("habitat-{}", self.config.name))),
            ("container", Some(key)) => self.container.get(key).cloned(),
            ("repositories" | "repos", Some(rest)) => {
                let mut parts = rest.splitn(2, '.');
                let index: usize = parts.next()?.parse().ok()?;
                let field = parts.next()?;
                let repo = self.config.repos.get(index)?;
                match field {
                    "url" => Some(repo.url.clone()),
                    "path" => Some(repo.path.clone()),
                    "branch" => repo.branch.clone(),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
