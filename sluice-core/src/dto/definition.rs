//! On-disk pipeline definition format
//!
//! Mirrors the build-server settings a project declares: a VCS root, then one
//! entry per pipeline with its steps, trigger rules, artifact rules and timeout.
//! Rule fields accept either a newline-separated string or a list of lines.

use serde::{Deserialize, Serialize};

/// Top-level definition document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub name: String,
    pub vcs_root: VcsRootFile,
    pub pipelines: Vec<PipelineFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsRootFile {
    pub url: String,

    #[serde(default = "default_branch")]
    pub default_branch: String,

    #[serde(default)]
    pub branch_spec: RuleText,
}

fn default_branch() -> String {
    "refs/heads/main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub steps: Vec<StepFile>,

    #[serde(default)]
    pub triggers: TriggerFile,

    #[serde(default)]
    pub artifact_rules: RuleText,

    /// Build timeout in minutes
    pub timeout_minutes: u64,

    #[serde(default)]
    pub status_context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFile {
    pub name: String,
    pub image: String,
    pub script: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerFile {
    #[serde(default)]
    pub branch_filter: RuleText,

    /// Path rules over changed files
    #[serde(default)]
    pub trigger_rules: Option<RuleText>,
}

/// Rule list, written either as one multi-line string or as an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleText {
    Text(String),
    Lines(Vec<String>),
}

impl Default for RuleText {
    fn default() -> Self {
        RuleText::Lines(Vec::new())
    }
}

impl RuleText {
    /// Non-blank, trimmed lines
    pub fn lines(&self) -> Vec<&str> {
        let raw: Vec<&str> = match self {
            RuleText::Text(text) => text.lines().collect(),
            RuleText::Lines(lines) => lines.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINT: &str = r#"{
        "name": "Mergify Demo",
        "vcs_root": {
            "url": "https://github.com/your-org/your-repo.git",
            "branch_spec": "+:refs/heads/*\n+:refs/pull/*/head"
        },
        "pipelines": [{
            "name": "Lint",
            "steps": [
                { "name": "Install Dependencies", "image": "node:20-alpine", "script": "npm ci" },
                { "name": "Run ESLint", "image": "node:20-alpine", "script": "npm run lint" }
            ],
            "triggers": { "branch_filter": ["+:pull/*", "+:refs/heads/main"] },
            "timeout_minutes": 10
        }]
    }"#;

    #[test]
    fn test_parse_project_file() {
        let project: ProjectFile = serde_json::from_str(LINT).unwrap();
        assert_eq!(project.vcs_root.default_branch, "refs/heads/main");
        assert_eq!(
            project.vcs_root.branch_spec.lines(),
            vec!["+:refs/heads/*", "+:refs/pull/*/head"]
        );

        let lint = &project.pipelines[0];
        assert_eq!(lint.steps.len(), 2);
        assert_eq!(
            lint.triggers.branch_filter.lines(),
            vec!["+:pull/*", "+:refs/heads/main"]
        );
        assert!(lint.triggers.trigger_rules.is_none());
        assert!(lint.artifact_rules.lines().is_empty());
    }

    #[test]
    fn test_rule_text_skips_blank_lines() {
        let text = RuleText::Text("\n  coverage/** => coverage.zip\n\n".to_string());
        assert_eq!(text.lines(), vec!["coverage/** => coverage.zip"]);
    }
}
