//! Trigger evaluation
//!
//! Decides which pipelines an incoming VCS event fires. Pure: no I/O and no
//! state beyond the VCS root the evaluator was built with.
//!
//! Rule lists follow build-server conventions: `+:` includes, `-:` excludes,
//! and when several rules match the last one decides. A list holding at least
//! one include rejects anything no rule matches; a list made only of
//! excludes accepts everything it does not exclude.

use glob::{MatchOptions, Pattern};
use sluice_core::domain::event::TriggerEvent;
use sluice_core::domain::pipeline::{FilterRule, PipelineDefinition, RuleAction, VcsRoot};
use std::borrow::Borrow;
use tracing::{debug, warn};

/// Branch filter token standing for the VCS root's default branch
pub const DEFAULT_BRANCH_TOKEN: &str = "<default>";

/// `*` crosses `/` in ref patterns (`pull/*` matches `pull/42`)
const REF_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// `*` stays inside one path segment; `**` spans directories
const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Evaluates trigger filters against events
#[derive(Debug, Clone, Default)]
pub struct TriggerEvaluator {
    vcs_root: Option<VcsRoot>,
}

impl TriggerEvaluator {
    pub fn new(vcs_root: VcsRoot) -> Self {
        Self {
            vcs_root: Some(vcs_root),
        }
    }

    pub fn vcs_root(&self) -> Option<&VcsRoot> {
        self.vcs_root.as_ref()
    }

    /// Returns the definitions whose filters the event satisfies
    pub fn evaluate<'a, D>(&self, event: &TriggerEvent, defs: &'a [D]) -> Vec<&'a D>
    where
        D: Borrow<PipelineDefinition>,
    {
        if !self.is_monitored(&event.git_ref) {
            debug!("Ref {} is not covered by the branch spec", event.git_ref);
            return Vec::new();
        }

        let names = self.branch_names(&event.git_ref);
        defs.iter()
            .filter(|def| self.matches(event, &names, (*def).borrow()))
            .collect()
    }

    fn matches(&self, event: &TriggerEvent, names: &[String], def: &PipelineDefinition) -> bool {
        let branch_ok = decide(&def.trigger.branch_filter, |pattern| {
            self.ref_pattern_matches(pattern, &event.git_ref, names)
        });
        if !branch_ok {
            return false;
        }

        match &def.trigger.path_filter {
            None => true,
            Some(rules) => match &event.changed_paths {
                Some(paths) => paths.iter().any(|path| {
                    decide(rules, |pattern| glob_matches(pattern, path, PATH_MATCH))
                }),
                None => {
                    debug!(
                        "Pipeline '{}' filters on paths but the event carries none",
                        def.name
                    );
                    false
                }
            },
        }
    }

    fn is_monitored(&self, git_ref: &str) -> bool {
        match &self.vcs_root {
            Some(root) if !root.branch_spec.is_empty() => decide(&root.branch_spec, |pattern| {
                pattern == DEFAULT_BRANCH_TOKEN && git_ref == root.default_branch
                    || glob_matches(pattern, git_ref, REF_MATCH)
            }),
            _ => true,
        }
    }

    fn ref_pattern_matches(&self, pattern: &str, git_ref: &str, names: &[String]) -> bool {
        if pattern == DEFAULT_BRANCH_TOKEN {
            return self
                .vcs_root
                .as_ref()
                .is_some_and(|root| root.default_branch == git_ref);
        }
        names
            .iter()
            .any(|name| glob_matches(pattern, name, REF_MATCH))
    }

    /// The full ref plus every logical name it is known by
    ///
    /// Logical names come from the branch spec (the text matched by the single
    /// `*` of an include pattern) and from provider conventions:
    /// `refs/heads/x` is `x` and `refs/pull/<n>/head` is `pull/<n>`.
    pub fn branch_names(&self, git_ref: &str) -> Vec<String> {
        let mut names = vec![git_ref.to_string()];
        let mut push = |name: String| {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        };

        if let Some(root) = &self.vcs_root {
            for rule in &root.branch_spec {
                if rule.action == RuleAction::Include {
                    if let Some(captured) = capture_star(&rule.pattern, git_ref) {
                        push(captured.to_string());
                        break;
                    }
                }
            }
        }

        if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
            push(branch.to_string());
        }
        if let Some(rest) = git_ref.strip_prefix("refs/pull/") {
            if let Some((number, "head" | "merge")) = rest.split_once('/') {
                push(format!("pull/{}", number));
            }
        }

        names
    }
}

/// Applies a rule list: last matching rule wins, see module docs for the default
fn decide<F>(rules: &[FilterRule], matches: F) -> bool
where
    F: Fn(&str) -> bool,
{
    if rules.is_empty() {
        return true;
    }

    let default = !rules.iter().any(|r| r.action == RuleAction::Include);
    rules
        .iter()
        .rev()
        .find(|rule| matches(&rule.pattern))
        .map(|rule| rule.action == RuleAction::Include)
        .unwrap_or(default)
}

fn glob_matches(pattern: &str, candidate: &str, options: MatchOptions) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(candidate, options),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Ignoring invalid trigger pattern");
            false
        }
    }
}

/// Text matched by the only `*` of a simple pattern like `refs/pull/*/head`
fn capture_star<'a>(pattern: &str, candidate: &'a str) -> Option<&'a str> {
    let (prefix, suffix) = pattern.split_once('*')?;
    let is_simple = |s: &str| !s.contains(['*', '?', '[']);
    if !is_simple(prefix) || !is_simple(suffix) {
        return None;
    }
    if candidate.len() < prefix.len() + suffix.len() {
        return None;
    }
    candidate
        .strip_prefix(prefix)?
        .strip_suffix(suffix)
        .filter(|captured| !captured.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::domain::pipeline::{StepSpec, TriggerFilter};
    use std::time::Duration;

    fn root() -> VcsRoot {
        VcsRoot {
            url: "https://github.com/your-org/your-repo.git".to_string(),
            default_branch: "refs/heads/main".to_string(),
            branch_spec: vec![
                FilterRule::include("refs/heads/*"),
                FilterRule::include("refs/pull/*/head"),
            ],
        }
    }

    fn pipeline(name: &str, branches: Vec<FilterRule>, paths: Option<Vec<FilterRule>>) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            description: None,
            steps: vec![StepSpec {
                position: 0,
                name: "step".to_string(),
                image: "alpine:3".to_string(),
                script: "true".to_string(),
            }],
            trigger: TriggerFilter {
                branch_filter: branches,
                path_filter: paths,
            },
            artifact_rules: vec![],
            timeout: Duration::from_secs(600),
            status_context: name.to_string(),
        }
    }

    fn names<'a>(matched: &[&'a PipelineDefinition]) -> Vec<&'a str> {
        matched.iter().map(|d| d.name.as_str()).collect()
    }

    fn tests_filter() -> Vec<FilterRule> {
        vec![
            FilterRule::include("pull/*"),
            FilterRule::include("refs/heads/main"),
        ]
    }

    #[test]
    fn test_main_matches_and_feature_does_not() {
        let defs = vec![pipeline("Tests", tests_filter(), None)];
        let evaluator = TriggerEvaluator::default();

        let main = TriggerEvent::push("refs/heads/main", "abc");
        assert_eq!(names(&evaluator.evaluate(&main, &defs)), vec!["Tests"]);

        let feature = TriggerEvent::push("refs/heads/feature-x", "abc");
        assert!(evaluator.evaluate(&feature, &defs).is_empty());
    }

    #[test]
    fn test_pull_request_logical_name() {
        let defs = vec![pipeline("Tests", tests_filter(), None)];
        let evaluator = TriggerEvaluator::new(root());

        let pr = TriggerEvent::pull_request("refs/pull/42/head", "abc");
        assert_eq!(names(&evaluator.evaluate(&pr, &defs)), vec!["Tests"]);
    }

    #[test]
    fn test_branch_names() {
        let evaluator = TriggerEvaluator::new(root());
        assert_eq!(
            evaluator.branch_names("refs/pull/42/head"),
            vec!["refs/pull/42/head", "42", "pull/42"]
        );
        assert_eq!(
            evaluator.branch_names("refs/heads/main"),
            vec!["refs/heads/main", "main"]
        );
    }

    #[test]
    fn test_unmonitored_ref_never_triggers() {
        let defs = vec![pipeline("Any", vec![], None)];
        let evaluator = TriggerEvaluator::new(root());

        let tag = TriggerEvent::push("refs/tags/v1.0.0", "abc");
        assert!(evaluator.evaluate(&tag, &defs).is_empty());

        let branch = TriggerEvent::push("refs/heads/anything", "abc");
        assert_eq!(evaluator.evaluate(&branch, &defs).len(), 1);
    }

    #[test]
    fn test_default_branch_token() {
        let defs = vec![pipeline("Nightly", vec![FilterRule::include("<default>")], None)];
        let evaluator = TriggerEvaluator::new(root());

        assert_eq!(
            evaluator
                .evaluate(&TriggerEvent::push("refs/heads/main", "abc"), &defs)
                .len(),
            1
        );
        assert!(
            evaluator
                .evaluate(&TriggerEvent::push("refs/heads/dev", "abc"), &defs)
                .is_empty()
        );
    }

    #[test]
    fn test_last_matching_rule_wins() {
        let include_then_exclude = vec![
            FilterRule::include("refs/heads/*"),
            FilterRule::exclude("refs/heads/wip-*"),
        ];
        let exclude_then_include = vec![
            FilterRule::exclude("refs/heads/wip-*"),
            FilterRule::include("refs/heads/*"),
        ];
        let defs = vec![
            pipeline("A", include_then_exclude, None),
            pipeline("B", exclude_then_include, None),
        ];
        let evaluator = TriggerEvaluator::default();

        let wip = TriggerEvent::push("refs/heads/wip-parser", "abc");
        assert_eq!(names(&evaluator.evaluate(&wip, &defs)), vec!["B"]);

        let release = TriggerEvent::push("refs/heads/release", "abc");
        assert_eq!(names(&evaluator.evaluate(&release, &defs)), vec!["A", "B"]);
    }

    #[test]
    fn test_exclude_only_filter_accepts_the_rest() {
        let defs = vec![pipeline("A", vec![FilterRule::exclude("pull/*")], None)];
        let evaluator = TriggerEvaluator::default();

        assert!(
            evaluator
                .evaluate(&TriggerEvent::pull_request("refs/pull/3/head", "abc"), &defs)
                .is_empty()
        );
        assert_eq!(
            evaluator
                .evaluate(&TriggerEvent::push("refs/heads/main", "abc"), &defs)
                .len(),
            1
        );
    }

    #[test]
    fn test_path_filter() {
        let defs = vec![
            pipeline(
                "Mergify Validation",
                vec![FilterRule::include("pull/*")],
                Some(vec![FilterRule::include(".mergify.yml")]),
            ),
            pipeline("Tests", tests_filter(), None),
        ];
        let evaluator = TriggerEvaluator::new(root());

        let touches_config = TriggerEvent::pull_request("refs/pull/9/head", "abc")
            .with_changed_paths(["src/index.ts", ".mergify.yml"]);
        assert_eq!(
            names(&evaluator.evaluate(&touches_config, &defs)),
            vec!["Mergify Validation", "Tests"]
        );

        let code_only = TriggerEvent::pull_request("refs/pull/9/head", "abc")
            .with_changed_paths(["src/index.ts"]);
        assert_eq!(names(&evaluator.evaluate(&code_only, &defs)), vec!["Tests"]);

        let unknown_paths = TriggerEvent::pull_request("refs/pull/9/head", "abc");
        assert_eq!(names(&evaluator.evaluate(&unknown_paths, &defs)), vec!["Tests"]);
    }

    #[test]
    fn test_path_globs_respect_separators() {
        let defs = vec![pipeline(
            "Docs",
            vec![],
            Some(vec![
                FilterRule::include("docs/**"),
                FilterRule::exclude("docs/*.tmp"),
            ]),
        )];
        let evaluator = TriggerEvaluator::default();
        let event = |path: &str| TriggerEvent::push("refs/heads/main", "abc").with_changed_paths([path]);

        assert_eq!(evaluator.evaluate(&event("docs/guide/setup.md"), &defs).len(), 1);
        assert!(evaluator.evaluate(&event("docs/draft.tmp"), &defs).is_empty());
        assert!(evaluator.evaluate(&event("src/docs.rs"), &defs).is_empty());
    }

    #[test]
    fn test_works_with_shared_definitions() {
        let defs = vec![std::sync::Arc::new(pipeline("Tests", tests_filter(), None))];
        let evaluator = TriggerEvaluator::default();
        let matched = evaluator.evaluate(&TriggerEvent::push("refs/heads/main", "abc"), &defs);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_capture_star() {
        assert_eq!(capture_star("refs/pull/*/head", "refs/pull/12/head"), Some("12"));
        assert_eq!(capture_star("refs/heads/*", "refs/heads/feature/x"), Some("feature/x"));
        assert_eq!(capture_star("refs/heads/*", "refs/heads/"), None);
        assert_eq!(capture_star("refs/heads/main", "refs/heads/main"), None);
    }
}
