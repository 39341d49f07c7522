//! Pipeline domain types
//!
//! Plain immutable records produced by the definitions loader. The runner never
//! depends on the format they were loaded from.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A project: one VCS root and the pipelines built from it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub name: String,
    pub vcs_root: VcsRoot,
    pub pipelines: Vec<PipelineDefinition>,
}

impl ProjectDefinition {
    /// Finds a pipeline by name
    pub fn pipeline(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}

/// Repository the pipelines check out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsRoot {
    pub url: String,

    /// Full ref of the default branch (e.g. "refs/heads/main")
    pub default_branch: String,

    /// Which refs are monitored; also used to derive logical branch names
    pub branch_spec: Vec<FilterRule>,
}

/// Pipeline definition
///
/// Identity is the name. Steps run strictly in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    pub trigger: TriggerFilter,
    pub artifact_rules: Vec<ArtifactRule>,
    pub timeout: Duration,

    /// Context name used for commit statuses
    pub status_context: String,
}

/// One containerized command of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Zero-based position in the pipeline
    pub position: usize,
    pub name: String,
    pub image: String,
    pub script: String,
}

/// Branch and path filters deciding whether an event fires a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerFilter {
    pub branch_filter: Vec<FilterRule>,

    /// When present, at least one changed path must be accepted
    pub path_filter: Option<Vec<FilterRule>>,
}

/// A single `+:pattern` / `-:pattern` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub action: RuleAction,
    pub pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Include,
    Exclude,
}

impl FilterRule {
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Include,
            pattern: pattern.into(),
        }
    }

    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Exclude,
            pattern: pattern.into(),
        }
    }
}

impl std::fmt::Display for FilterRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.action {
            RuleAction::Include => write!(f, "+:{}", self.pattern),
            RuleAction::Exclude => write!(f, "-:{}", self.pattern),
        }
    }
}

/// Which build outputs are kept after a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRule {
    /// Glob relative to the working tree (e.g. "coverage/**")
    pub source: String,

    /// Archive the matches are stored under (e.g. "coverage.zip")
    pub archive: String,
}

impl std::fmt::Display for ArtifactRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} => {}", self.source, self.archive)
    }
}
