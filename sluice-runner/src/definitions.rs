//! Pipeline definitions loader
//!
//! Turns the on-disk definition document into immutable domain records.
//! Any malformed pipeline rejects the whole set.

use sluice_core::domain::event::TriggerEvent;
use sluice_core::domain::pipeline::{
    ArtifactRule, FilterRule, PipelineDefinition, ProjectDefinition, RuleAction, StepSpec,
    TriggerFilter, VcsRoot,
};
use sluice_core::dto::definition::{PipelineFile, ProjectFile, RuleText};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::trigger::{DEFAULT_BRANCH_TOKEN, TriggerEvaluator};

/// Loads and validates a definition document from disk
pub fn load_file(path: impl AsRef<Path>) -> Result<ProjectDefinition, ConfigError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Read {} bytes of definitions from {}", source.len(), path.display());
    load_str(&source)
}

/// Loads and validates a definition document from a JSON string
pub fn load_str(source: &str) -> Result<ProjectDefinition, ConfigError> {
    let file: ProjectFile = serde_json::from_str(source)?;
    from_file(file)
}

/// Converts a parsed document into domain records
pub fn from_file(file: ProjectFile) -> Result<ProjectDefinition, ConfigError> {
    if file.name.trim().is_empty() {
        return Err(ConfigError::InvalidProject(
            "project name cannot be empty".to_string(),
        ));
    }
    if file.vcs_root.url.trim().is_empty() {
        return Err(ConfigError::InvalidProject(
            "vcs_root.url cannot be empty".to_string(),
        ));
    }

    let vcs_root = VcsRoot {
        url: file.vcs_root.url,
        default_branch: file.vcs_root.default_branch,
        branch_spec: parse_rules(&file.vcs_root.branch_spec, PatternKind::Ref)?,
    };

    let mut seen = HashSet::new();
    let mut pipelines = Vec::with_capacity(file.pipelines.len());
    for pipeline in file.pipelines {
        if !seen.insert(pipeline.name.clone()) {
            return Err(ConfigError::DuplicatePipeline(pipeline.name));
        }
        pipelines.push(convert_pipeline(&file.name, pipeline)?);
    }

    info!(
        "Loaded project '{}' with {} pipeline(s)",
        file.name,
        pipelines.len()
    );

    Ok(ProjectDefinition {
        name: file.name,
        vcs_root,
        pipelines,
    })
}

fn convert_pipeline(project: &str, file: PipelineFile) -> Result<PipelineDefinition, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidPipeline {
        pipeline: file.name.clone(),
        message: message.to_string(),
    };

    if file.name.trim().is_empty() {
        return Err(ConfigError::InvalidProject(
            "pipeline name cannot be empty".to_string(),
        ));
    }
    if file.steps.is_empty() {
        return Err(invalid("at least one step is required"));
    }
    if file.timeout_minutes == 0 {
        return Err(invalid("timeout_minutes must be greater than 0"));
    }
    let timeout = file
        .timeout_minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("timeout_minutes is too large"))?;

    let mut steps = Vec::with_capacity(file.steps.len());
    for (position, step) in file.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(invalid(&format!("step {} has no name", position + 1)));
        }
        if step.image.trim().is_empty() {
            return Err(invalid(&format!("step '{}' has no image", step.name)));
        }
        if step.script.trim().is_empty() {
            return Err(invalid(&format!("step '{}' has an empty script", step.name)));
        }
        steps.push(StepSpec {
            position,
            name: step.name.clone(),
            image: step.image.trim().to_string(),
            script: step.script.clone(),
        });
    }

    let trigger = TriggerFilter {
        branch_filter: parse_rules(&file.triggers.branch_filter, PatternKind::Ref)?,
        path_filter: file
            .triggers
            .trigger_rules
            .as_ref()
            .map(|rules| parse_rules(rules, PatternKind::Path))
            .transpose()?,
    };

    let status_context = file
        .status_context
        .clone()
        .unwrap_or_else(|| format!("{} ({})", file.name, project));

    Ok(PipelineDefinition {
        artifact_rules: parse_artifact_rules(&file.artifact_rules)?,
        name: file.name,
        description: file.description,
        steps,
        trigger,
        timeout,
        status_context,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Ref,
    Path,
}

/// Parses `+:pattern` / `-:pattern` lines; a bare pattern is an include
fn parse_rules(text: &RuleText, kind: PatternKind) -> Result<Vec<FilterRule>, ConfigError> {
    text.lines()
        .into_iter()
        .map(|line| parse_rule(line, kind))
        .collect()
}

fn parse_rule(line: &str, kind: PatternKind) -> Result<FilterRule, ConfigError> {
    let (action, pattern) = if let Some(rest) = line.strip_prefix("+:") {
        (RuleAction::Include, rest.trim())
    } else if let Some(rest) = line.strip_prefix("-:") {
        (RuleAction::Exclude, rest.trim())
    } else {
        (RuleAction::Include, line)
    };

    if pattern.is_empty() {
        return Err(ConfigError::InvalidRule {
            rule: line.to_string(),
            message: "pattern cannot be empty".to_string(),
        });
    }

    let is_token = kind == PatternKind::Ref && pattern == DEFAULT_BRANCH_TOKEN;
    if !is_token {
        glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidRule {
            rule: line.to_string(),
            message: e.to_string(),
        })?;
    }

    Ok(FilterRule {
        action,
        pattern: pattern.to_string(),
    })
}

/// Parses `source => archive` lines
fn parse_artifact_rules(text: &RuleText) -> Result<Vec<ArtifactRule>, ConfigError> {
    text.lines()
        .into_iter()
        .map(|line| {
            let invalid = |message: &str| ConfigError::InvalidRule {
                rule: line.to_string(),
                message: message.to_string(),
            };

            let (source, archive) = line
                .split_once("=>")
                .ok_or_else(|| invalid("expected 'source => archive'"))?;
            let (source, archive) = (source.trim(), archive.trim());

            if source.is_empty() || archive.is_empty() {
                return Err(invalid("source and archive must both be set"));
            }
            if source.starts_with('/') || source.split('/').any(|part| part == "..") {
                return Err(invalid("source must stay inside the working tree"));
            }
            if archive.contains('/') || archive.contains("..") {
                return Err(invalid("archive must be a plain file name"));
            }
            glob::Pattern::new(source).map_err(|e| invalid(&e.to_string()))?;

            Ok(ArtifactRule {
                source: source.to_string(),
                archive: archive.to_string(),
            })
        })
        .collect()
}

/// A loaded project ready to be shared with the scheduler
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    project: String,
    evaluator: TriggerEvaluator,
    pipelines: Vec<Arc<PipelineDefinition>>,
}

impl DefinitionSet {
    pub fn new(project: ProjectDefinition) -> Self {
        Self {
            project: project.name,
            evaluator: TriggerEvaluator::new(project.vcs_root),
            pipelines: project.pipelines.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn vcs_root(&self) -> Option<&VcsRoot> {
        self.evaluator.vcs_root()
    }

    pub fn pipelines(&self) -> &[Arc<PipelineDefinition>] {
        &self.pipelines
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PipelineDefinition>> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Pipelines the event fires, in declaration order
    pub fn matching(&self, event: &TriggerEvent) -> Vec<Arc<PipelineDefinition>> {
        self.evaluator
            .evaluate(event, &self.pipelines)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"{
        "name": "Mergify Demo",
        "vcs_root": {
            "url": "https://github.com/your-org/your-repo.git",
            "default_branch": "refs/heads/main",
            "branch_spec": "+:refs/heads/*\n+:refs/pull/*/head"
        },
        "pipelines": [
            {
                "name": "Tests",
                "description": "Run unit and integration tests",
                "steps": [
                    { "name": "Install Dependencies", "image": "node:20-alpine", "script": "npm ci" },
                    { "name": "Run Unit Tests", "image": "node:20-alpine", "script": "npm run test:unit" }
                ],
                "triggers": { "branch_filter": "+:pull/*\n+:refs/heads/main" },
                "artifact_rules": "coverage/** => coverage.zip\ntest-results/** => test-results.zip",
                "timeout_minutes": 30
            },
            {
                "name": "Mergify Validation",
                "steps": [
                    { "name": "Validate Mergify Configuration", "image": "python:3.11-alpine", "script": "mergify validate .mergify.yml" }
                ],
                "triggers": { "branch_filter": "+:pull/*", "trigger_rules": "+:.mergify.yml" },
                "timeout_minutes": 5
            }
        ]
    }"#;

    #[test]
    fn test_load_project() {
        let project = load_str(PROJECT).unwrap();
        assert_eq!(project.pipelines.len(), 2);
        assert_eq!(project.vcs_root.branch_spec.len(), 2);

        let tests = project.pipeline("Tests").unwrap();
        assert_eq!(tests.timeout, Duration::from_secs(30 * 60));
        assert_eq!(tests.status_context, "Tests (Mergify Demo)");
        assert_eq!(tests.steps[1].position, 1);
        assert_eq!(tests.artifact_rules.len(), 2);
        assert_eq!(tests.artifact_rules[0].archive, "coverage.zip");
        assert!(tests.trigger.path_filter.is_none());

        let mergify = project.pipeline("Mergify Validation").unwrap();
        assert_eq!(
            mergify.trigger.path_filter,
            Some(vec![FilterRule::include(".mergify.yml")])
        );
    }

    #[test]
    fn test_parse_rule_forms() {
        assert_eq!(
            parse_rule("+:refs/heads/main", PatternKind::Ref).unwrap(),
            FilterRule::include("refs/heads/main")
        );
        assert_eq!(
            parse_rule("-:refs/heads/wip/*", PatternKind::Ref).unwrap(),
            FilterRule::exclude("refs/heads/wip/*")
        );
        assert_eq!(
            parse_rule("pull/*", PatternKind::Ref).unwrap(),
            FilterRule::include("pull/*")
        );
        assert_eq!(
            parse_rule("+:<default>", PatternKind::Ref).unwrap(),
            FilterRule::include("<default>")
        );
        assert!(parse_rule("+:", PatternKind::Ref).is_err());
        assert!(parse_rule("+:src/[", PatternKind::Path).is_err());
    }

    #[test]
    fn test_artifact_rule_validation() {
        let ok = RuleText::Text("dist/** => build.zip".to_string());
        assert_eq!(parse_artifact_rules(&ok).unwrap().len(), 1);

        for bad in [
            "dist/**",
            "=> build.zip",
            "../secrets/** => leak.zip",
            "/etc/** => etc.zip",
            "dist/** => nested/build.zip",
        ] {
            let text = RuleText::Text(bad.to_string());
            assert!(parse_artifact_rules(&text).is_err(), "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_rejects_whole_set() {
        let duplicate = PROJECT.replace("\"Mergify Validation\"", "\"Tests\"");
        assert!(matches!(
            load_str(&duplicate),
            Err(ConfigError::DuplicatePipeline(name)) if name == "Tests"
        ));

        let no_timeout = PROJECT.replace("\"timeout_minutes\": 5", "\"timeout_minutes\": 0");
        assert!(matches!(
            load_str(&no_timeout),
            Err(ConfigError::InvalidPipeline { pipeline, .. }) if pipeline == "Mergify Validation"
        ));

        let huge_timeout = PROJECT.replace(
            "\"timeout_minutes\": 5",
            "\"timeout_minutes\": 400000000000000000",
        );
        assert!(matches!(
            load_str(&huge_timeout),
            Err(ConfigError::InvalidPipeline { pipeline, message })
                if pipeline == "Mergify Validation" && message.contains("too large")
        ));

        let no_image = PROJECT.replace("\"python:3.11-alpine\"", "\"  \"");
        assert!(load_str(&no_image).is_err());

        assert!(matches!(load_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = load_file("/nonexistent/sluice.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_definition_set_matching() {
        let set = DefinitionSet::new(load_str(PROJECT).unwrap());
        assert_eq!(set.project(), "Mergify Demo");
        assert!(set.get("Tests").is_some());

        let push = TriggerEvent::push("refs/heads/main", "abc");
        let names: Vec<String> = set.matching(&push).iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["Tests".to_string()]);

        let pr = TriggerEvent::pull_request("refs/pull/7/head", "def")
            .with_changed_paths([".mergify.yml"]);
        let names: Vec<String> = set.matching(&pr).iter().map(|p| p.name.clone()).collect();
        assert_eq!(
            names,
            vec!["Tests".to_string(), "Mergify Validation".to_string()]
        );
    }
}
