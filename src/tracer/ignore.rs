//! Ignore rules
//!
//! A matched run is still tracked and still emits `start`/`end`, but its payload
//! is replaced by [`NOT_INGESTED`](super::events::NOT_INGESTED). Rules that set
//! `suppress_descendants` redact the whole subtree below the matched run.

use super::events::RunType;
use super::run_manager::RunManager;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One rule as configured, e.g. `{"type": "tool", "name": ["secret_*"]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreRule {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub run_type: Option<RunType>,
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    #[serde(default)]
    pub suppress_descendants: bool,
}

impl IgnoreRule {
    pub fn for_type(run_type: RunType) -> Self {
        Self {
            run_type: Some(run_type),
            ..Default::default()
        }
    }

    pub fn named<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_descendants(mut self) -> Self {
        self.suppress_descendants = true;
        self
    }
}

enum NameMatcher {
    Glob(Pattern),
    Exact(String),
}

impl NameMatcher {
    fn compile(raw: &str) -> Self {
        match Pattern::new(raw) {
            Ok(pattern) => NameMatcher::Glob(pattern),
            Err(e) => {
                warn!(pattern = raw, error = %e, "Invalid ignore pattern, using exact match");
                NameMatcher::Exact(raw.to_string())
            }
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatcher::Glob(pattern) => pattern.matches(name),
            NameMatcher::Exact(exact) => exact == name,
        }
    }
}

struct CompiledRule {
    run_type: Option<RunType>,
    names: Option<Vec<NameMatcher>>,
    suppress_descendants: bool,
}

impl CompiledRule {
    /// Names decide; the type only narrows, and is skipped for runs without one
    fn matches(&self, run_type: Option<&RunType>, name: Option<&str>) -> bool {
        let Some(patterns) = &self.names else {
            return false;
        };

        if let (Some(expected), Some(actual)) = (&self.run_type, run_type) {
            if !expected.matches(actual) {
                return false;
            }
        }

        name.is_some_and(|name| patterns.iter().any(|pattern| pattern.matches(name)))
    }
}

/// Compiled rule list, evaluated in configuration order
#[derive(Default)]
pub struct IgnoreFilter {
    rules: Vec<CompiledRule>,
}

impl IgnoreFilter {
    pub fn new(rules: &[IgnoreRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| CompiledRule {
                run_type: rule.run_type.clone(),
                names: rule
                    .names
                    .as_ref()
                    .map(|names| names.iter().map(|n| NameMatcher::compile(n)).collect()),
                suppress_descendants: rule.suppress_descendants,
            })
            .collect();

        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide whether the payload of `run_id` must be redacted
    ///
    /// The first matching rule flags the run in `runs`, so later lookups for its
    /// descendants can find it. Without a direct match the ancestor chain decides.
    pub fn should_ignore(
        &self,
        runs: &RunManager,
        run_id: &str,
        run_type: Option<&RunType>,
        name: Option<&str>,
    ) -> bool {
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(run_type, name)) {
            runs.mark_ignored(run_id, rule.suppress_descendants);
            debug!(run_id = run_id, name = ?name, "Run matched ignore rule");
            return true;
        }

        runs.is_suppressed(run_id)
    }
}
