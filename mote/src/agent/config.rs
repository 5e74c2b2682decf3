//! Per-agent configuration.

use serde::{Deserialize, Serialize};

use super::step::Step;

fn default_allow_delegation() -> bool {
    true
}

/// Definition of a single agent: its workflow steps plus the runtime
/// settings the sub-runner honors when materializing it.
///
/// An agent with zero steps is still callable: the engine synthesizes a
/// single `exec` step wrapping the caller's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent name, the catalog key.
    pub name: String,

    /// Human-readable description, used in delegation prompts.
    #[serde(default)]
    pub description: String,

    /// Model override; the pool default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Agent-specific system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Ordered workflow steps. Empty means LLM-driven (stepless).
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Bound on self-recursion through routes. Zero forbids self-routing.
    #[serde(default)]
    pub max_recursion: u32,

    /// Tool allow-list applied to the cloned registry. `None` keeps all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,

    /// Whether this agent may delegate further. When false the `delegate`
    /// tool is stripped from its registry.
    #[serde(default = "default_allow_delegation")]
    pub allow_delegation: bool,

    /// Per-agent delegation depth bound, tighter than the session's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,

    /// Wall-clock bound for one run of this agent, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl AgentConfig {
    /// Create a minimal agent with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model: None,
            system_prompt: None,
            steps: Vec::new(),
            max_recursion: 0,
            tools: None,
            allow_delegation: true,
            max_depth: None,
            timeout_secs: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the model override.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Replace the workflow steps.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    /// Append one workflow step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Set the self-recursion bound.
    #[must_use]
    pub const fn with_max_recursion(mut self, max_recursion: u32) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    /// Restrict the tool surface to the named tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Forbid or allow further delegation from this agent.
    #[must_use]
    pub const fn with_allow_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }

    /// Set the per-agent delegation depth bound.
    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    /// Set the per-run wall-clock bound.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Whether this agent declares structured workflow steps.
    #[must_use]
    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }
}
