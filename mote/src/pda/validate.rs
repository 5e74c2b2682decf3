//! Pre-execution validation of workflow graphs.
//!
//! Runs once before a fresh execution. Every reachable agent is visited;
//! rule violations accumulate into a diagnostic list. Any error-level
//! diagnostic aborts execution before the first step runs.

use std::collections::HashSet;

use crate::agent::{AgentConfig, AgentLookup, END_TARGET, Step};

/// Severity of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// Aborts execution.
    Error,
    /// Logged, execution proceeds.
    Warning,
}

/// Validation rule codes.
pub mod codes {
    /// An agent declaring steps must have at least one.
    pub const EMPTY_STEPS: &str = "EMPTY_STEPS";
    /// An `agent_ref` step targets an agent missing from the catalog.
    pub const MISSING_AGENT_REF: &str = "MISSING_AGENT_REF";
    /// A route step has no branches.
    pub const EMPTY_ROUTE_BRANCHES: &str = "EMPTY_ROUTE_BRANCHES";
    /// A route branch points at an unknown agent.
    pub const ROUTE_TARGET_NOT_FOUND: &str = "ROUTE_TARGET_NOT_FOUND";
    /// A route has no `_default` branch.
    pub const MISSING_DEFAULT_ROUTE: &str = "MISSING_DEFAULT_ROUTE";
    /// A branch targets self but the agent allows no recursion.
    pub const SELF_ROUTE_NO_LIMIT: &str = "SELF_ROUTE_NO_LIMIT";
    /// The recursion bound is suspiciously large.
    pub const EXCESSIVE_RECURSION: &str = "EXCESSIVE_RECURSION";
    /// Following references leads back to the origin agent.
    pub const CYCLIC_DEPENDENCY: &str = "CYCLIC_DEPENDENCY";
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity.
    pub level: DiagnosticLevel,
    /// Rule code, one of [`codes`].
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// The agent the finding concerns.
    pub agent: String,
    /// The offending step, when the rule is step-scoped.
    pub step_index: Option<usize>,
}

impl Diagnostic {
    fn error(code: &'static str, agent: &str, step: Option<usize>, message: String) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            code,
            message,
            agent: agent.to_string(),
            step_index: step,
        }
    }

    fn warning(code: &'static str, agent: &str, step: Option<usize>, message: String) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            code,
            message,
            agent: agent.to_string(),
            step_index: step,
        }
    }
}

/// Whether any diagnostic is error-level.
#[must_use]
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics
        .iter()
        .any(|d| d.level == DiagnosticLevel::Error)
}

/// Validate the workflow graph rooted at `root`.
#[must_use]
pub fn validate(root: &AgentConfig, lookup: &AgentLookup) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if root.steps.is_empty() {
        diagnostics.push(Diagnostic::error(
            codes::EMPTY_STEPS,
            &root.name,
            None,
            format!("agent '{}' declares a workflow with no steps", root.name),
        ));
        return diagnostics;
    }

    let mut visited = HashSet::new();
    validate_agent(root, lookup, &mut visited, &mut diagnostics);

    if let Some(cycle) = find_cycle(root, lookup) {
        diagnostics.push(Diagnostic::error(
            codes::CYCLIC_DEPENDENCY,
            &root.name,
            None,
            format!("cyclic dependency: {}", cycle.join(" -> ")),
        ));
    }

    diagnostics
}

fn validate_agent(
    agent: &AgentConfig,
    lookup: &AgentLookup,
    visited: &mut HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if !visited.insert(agent.name.clone()) {
        return;
    }

    if agent.max_recursion > 100 {
        diagnostics.push(Diagnostic::warning(
            codes::EXCESSIVE_RECURSION,
            &agent.name,
            None,
            format!(
                "max_recursion {} exceeds the recommended bound of 100",
                agent.max_recursion
            ),
        ));
    }

    for (index, step) in agent.steps.iter().enumerate() {
        match step {
            Step::Prompt { .. } | Step::Exec { .. } => {}

            Step::AgentRef { agent: target, .. } => match lookup(target) {
                Some(child) => validate_agent(&child, lookup, visited, diagnostics),
                None => diagnostics.push(Diagnostic::error(
                    codes::MISSING_AGENT_REF,
                    &agent.name,
                    Some(index),
                    format!("step references unknown agent '{target}'"),
                )),
            },

            Step::Route { branches, .. } => {
                if branches.is_empty() {
                    diagnostics.push(Diagnostic::error(
                        codes::EMPTY_ROUTE_BRANCHES,
                        &agent.name,
                        Some(index),
                        "route step has no branches".to_string(),
                    ));
                    continue;
                }

                if !branches.contains_key(crate::agent::DEFAULT_BRANCH) {
                    diagnostics.push(Diagnostic::warning(
                        codes::MISSING_DEFAULT_ROUTE,
                        &agent.name,
                        Some(index),
                        "route has no '_default' branch".to_string(),
                    ));
                }

                for (key, target) in branches {
                    if target == END_TARGET {
                        continue;
                    }
                    if target == &agent.name {
                        if agent.max_recursion == 0 {
                            diagnostics.push(Diagnostic::error(
                                codes::SELF_ROUTE_NO_LIMIT,
                                &agent.name,
                                Some(index),
                                format!(
                                    "branch '{key}' routes to self but max_recursion is not set"
                                ),
                            ));
                        }
                        continue;
                    }
                    match lookup(target) {
                        Some(child) => validate_agent(&child, lookup, visited, diagnostics),
                        None => diagnostics.push(Diagnostic::error(
                            codes::ROUTE_TARGET_NOT_FOUND,
                            &agent.name,
                            Some(index),
                            format!("branch '{key}' targets unknown agent '{target}'"),
                        )),
                    }
                }
            }
        }
    }
}

/// Referenced agents: `agent_ref` targets plus route targets, excluding
/// `_end` and self-references.
fn references(agent: &AgentConfig) -> Vec<String> {
    let mut out = Vec::new();
    for step in &agent.steps {
        match step {
            Step::AgentRef { agent: target, .. } => out.push(target.clone()),
            Step::Route { branches, .. } => {
                for target in branches.values() {
                    if target != END_TARGET && target != &agent.name {
                        out.push(target.clone());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// DFS from the origin; reports the path when any reference chain returns
/// to the origin agent.
fn find_cycle(origin: &AgentConfig, lookup: &AgentLookup) -> Option<Vec<String>> {
    fn dfs(
        current: &AgentConfig,
        origin: &str,
        lookup: &AgentLookup,
        path: &mut Vec<String>,
        seen: &mut HashSet<String>,
    ) -> bool {
        for target in references(current) {
            if target == origin {
                path.push(target);
                return true;
            }
            if !seen.insert(target.clone()) {
                continue;
            }
            if let Some(child) = lookup(&target) {
                path.push(target);
                if dfs(&child, origin, lookup, path, seen) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![origin.name.clone()];
    let mut seen = HashSet::new();
    if dfs(origin, &origin.name, lookup, &mut path, &mut seen) {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentCatalog;

    fn lookup_for(catalog: AgentCatalog) -> AgentLookup {
        catalog.lookup_fn()
    }

    #[test]
    fn empty_steps_is_an_error() {
        let root = AgentConfig::new("main");
        let diags = validate(&root, &lookup_for(AgentCatalog::new()));
        assert!(has_errors(&diags));
        assert_eq!(diags[0].code, codes::EMPTY_STEPS);
    }

    #[test]
    fn missing_agent_ref_reports_step_index() {
        let root = AgentConfig::new("main")
            .with_step(Step::prompt("a"))
            .with_step(Step::agent_ref("ghost", ""));
        let diags = validate(&root, &lookup_for(AgentCatalog::new()));
        let diag = diags
            .iter()
            .find(|d| d.code == codes::MISSING_AGENT_REF)
            .unwrap();
        assert_eq!(diag.step_index, Some(1));
    }

    #[test]
    fn self_route_requires_recursion_limit() {
        let root = AgentConfig::new("looper")
            .with_step(Step::route("again?", [("continue", "looper"), ("_default", "_end")]));
        let diags = validate(&root, &lookup_for(AgentCatalog::new()));
        assert!(diags.iter().any(|d| d.code == codes::SELF_ROUTE_NO_LIMIT));

        let ok = AgentConfig::new("looper")
            .with_max_recursion(3)
            .with_step(Step::route("again?", [("continue", "looper"), ("_default", "_end")]));
        let diags = validate(&ok, &lookup_for(AgentCatalog::new()));
        assert!(!has_errors(&diags));
    }

    #[test]
    fn missing_default_is_only_a_warning() {
        let catalog = AgentCatalog::new();
        catalog.insert(AgentConfig::new("other").with_step(Step::prompt("x")));
        let root =
            AgentConfig::new("main").with_step(Step::route("pick", [("go", "other")]));
        let diags = validate(&root, &lookup_for(catalog));
        assert!(!has_errors(&diags));
        assert!(diags.iter().any(|d| d.code == codes::MISSING_DEFAULT_ROUTE));
    }

    #[test]
    fn detects_cycle_back_to_origin() {
        let catalog = AgentCatalog::new();
        catalog.insert(AgentConfig::new("b").with_step(Step::agent_ref("c", "")));
        catalog.insert(AgentConfig::new("c").with_step(Step::agent_ref("a", "")));
        let root = AgentConfig::new("a").with_step(Step::agent_ref("b", ""));
        // Catalog must contain the root for the cycle edge c -> a to resolve.
        catalog.insert(root.clone());

        let diags = validate(&root, &lookup_for(catalog));
        let cycle = diags
            .iter()
            .find(|d| d.code == codes::CYCLIC_DEPENDENCY)
            .unwrap();
        assert!(cycle.message.contains("a -> b -> c -> a"));
    }

    #[test]
    fn excessive_recursion_warns() {
        let root = AgentConfig::new("looper")
            .with_max_recursion(500)
            .with_step(Step::route("again?", [("continue", "looper"), ("_default", "_end")]));
        let diags = validate(&root, &lookup_for(AgentCatalog::new()));
        assert!(diags.iter().any(|d| d.code == codes::EXCESSIVE_RECURSION));
        assert!(!has_errors(&diags));
    }
}
