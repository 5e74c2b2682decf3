//! Workflow step productions.
//!
//! A step is one production symbol in an agent's workflow grammar. The set
//! is closed: the engine dispatches on the tag, never on open polymorphism.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The branch key a route falls back to when the reply matches nothing.
pub const DEFAULT_BRANCH: &str = "_default";

/// The branch target that terminates a route without pushing a frame.
pub const END_TARGET: &str = "_end";

/// Whether a branch key is reserved (`_default`, `_end`, `_new_*`, ...).
///
/// Reserved keys are excluded from the option list presented to the LLM.
#[must_use]
pub fn is_reserved_branch_key(key: &str) -> bool {
    key.starts_with('_')
}

/// A single production in an agent's workflow grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Terminal: one LLM turn with `content` as the instruction.
    Prompt {
        /// The instruction passed to the LLM as user input.
        content: String,
        /// Optional audit tag recorded in the executed-step trail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// Non-terminal: invoke another agent, passing `content` through.
    AgentRef {
        /// Name of the target agent in the catalog.
        agent: String,
        /// Input passed through to the child agent.
        #[serde(default)]
        content: String,
        /// Optional audit tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// Ask the LLM to pick one of a set of named branches.
    ///
    /// Branches map keys to target agents. The map is ordered so branch
    /// enumeration is stable across runs.
    Route {
        /// The routing question put to the LLM.
        prompt: String,
        /// Branch key to target agent. Target [`END_TARGET`] terminates.
        branches: BTreeMap<String, String>,
        /// Optional audit tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// Synthesized wrapper for a stepless agent: one full tool-loop turn.
    Exec {
        /// Input for the turn.
        content: String,
        /// Optional audit tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl Step {
    /// Create a prompt step.
    #[must_use]
    pub fn prompt(content: impl Into<String>) -> Self {
        Self::Prompt {
            content: content.into(),
            label: None,
        }
    }

    /// Create an agent reference step.
    #[must_use]
    pub fn agent_ref(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::AgentRef {
            agent: agent.into(),
            content: content.into(),
            label: None,
        }
    }

    /// Create a route step from `(key, target)` pairs.
    #[must_use]
    pub fn route<K, V>(prompt: impl Into<String>, branches: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::Route {
            prompt: prompt.into(),
            branches: branches
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            label: None,
        }
    }

    /// Create the exec step synthesized for a stepless agent.
    #[must_use]
    pub fn exec(content: impl Into<String>) -> Self {
        Self::Exec {
            content: content.into(),
            label: None,
        }
    }

    /// Attach an audit label.
    #[must_use]
    pub fn with_label(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            Self::Prompt { label, .. }
            | Self::AgentRef { label, .. }
            | Self::Route { label, .. }
            | Self::Exec { label, .. } => *label = Some(value.into()),
        }
        self
    }

    /// The step's audit label, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Prompt { label, .. }
            | Self::AgentRef { label, .. }
            | Self::Route { label, .. }
            | Self::Exec { label, .. } => label.as_deref(),
        }
    }

    /// The step variant name as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::AgentRef { .. } => "agent_ref",
            Self::Route { .. } => "route",
            Self::Exec { .. } => "exec",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let step = Step::agent_ref("worker", "do the thing").with_label("dispatch");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "agent_ref");
        assert_eq!(json["agent"], "worker");
        assert_eq!(json["label"], "dispatch");
    }

    #[test]
    fn deserializes_route_branches_in_order() {
        let json = serde_json::json!({
            "type": "route",
            "prompt": "pick one",
            "branches": {"b": "beta", "a": "alpha", "_default": "alpha"}
        });
        let step: Step = serde_json::from_value(json).unwrap();
        let Step::Route { branches, .. } = &step else {
            panic!("expected route");
        };
        let keys: Vec<&str> = branches.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["_default", "a", "b"]);
    }

    #[test]
    fn reserved_keys_start_with_underscore() {
        assert!(is_reserved_branch_key("_default"));
        assert!(is_reserved_branch_key("_new_topic"));
        assert!(!is_reserved_branch_key("continue"));
    }
}
