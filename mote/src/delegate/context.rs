//! The delegation envelope.
//!
//! A [`DelegateContext`] travels with every execution. It is immutable per
//! call: spawning a child yields a fresh envelope via [`DelegateContext::for_child`],
//! and mutation of the child's counters never leaks back to the parent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Absolute delegation depth ceiling. Not configurable; the session's
/// [`DelegateContext::max_depth`] can only tighten it.
pub const HARD_MAX_DELEGATION_DEPTH: usize = 5;

/// Default per-session delegation depth bound.
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 3;

/// Delegation envelope carried across call boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateContext {
    /// Current delegation depth; the root agent sits at zero.
    pub depth: usize,

    /// Session-configured depth bound.
    pub max_depth: usize,

    /// Session id of the spawning parent, populated at the first boundary
    /// that can see it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,

    /// Name of the currently executing agent.
    pub agent: String,

    /// Ordered ancestor chain from root to current, including self.
    pub chain: Vec<String>,

    /// Per-agent recursion counters. Audit fields: self-recursion
    /// enforcement reads the execution state's counter, not these.
    #[serde(default)]
    pub recursion_counters: HashMap<String, u32>,
}

impl DelegateContext {
    /// Create the root envelope for a session.
    #[must_use]
    pub fn root(agent: impl Into<String>) -> Self {
        let agent = agent.into();
        Self {
            depth: 0,
            max_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            parent_session: None,
            agent: agent.clone(),
            chain: vec![agent],
            recursion_counters: HashMap::new(),
        }
    }

    /// Override the session depth bound.
    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the parent session id.
    #[must_use]
    pub fn with_parent_session(mut self, session: impl Into<String>) -> Self {
        self.parent_session = Some(session.into());
        self
    }

    /// Derive the envelope for a child invocation.
    ///
    /// Depth is incremented, the chain is extended with the child, and the
    /// counter map is deep-copied so the child's bumps stay its own.
    #[must_use]
    pub fn for_child(&self, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        let mut chain = self.chain.clone();
        chain.push(agent.clone());
        Self {
            depth: self.depth + 1,
            max_depth: self.max_depth,
            parent_session: self.parent_session.clone(),
            agent,
            chain,
            recursion_counters: self.recursion_counters.clone(),
        }
    }

    /// Whether the named agent already appears in the ancestor chain.
    #[must_use]
    pub fn contains(&self, agent: &str) -> bool {
        self.chain.iter().any(|a| a == agent)
    }

    /// Record a recursion occurrence for audit.
    pub fn bump_recursion(&mut self, agent: &str) {
        *self
            .recursion_counters
            .entry(agent.to_string())
            .or_insert(0) += 1;
    }

    /// The chain rendered as `root -> ... -> current`.
    #[must_use]
    pub fn chain_display(&self) -> String {
        self.chain.join(" -> ")
    }

    /// Whether spawning one more child would exceed either bound.
    #[must_use]
    pub fn at_depth_limit(&self) -> bool {
        self.depth + 1 > self.max_depth.min(HARD_MAX_DELEGATION_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_child_extends_chain_and_depth() {
        let root = DelegateContext::root("main");
        let child = root.for_child("worker");

        assert_eq!(child.depth, 1);
        assert_eq!(child.agent, "worker");
        assert_eq!(child.chain, vec!["main", "worker"]);
        assert_eq!(root.chain, vec!["main"]);
    }

    #[test]
    fn child_counter_mutation_never_leaks_to_parent() {
        let mut root = DelegateContext::root("main");
        root.bump_recursion("main");

        let mut child = root.for_child("worker");
        child.bump_recursion("worker");
        child.bump_recursion("main");

        assert_eq!(root.recursion_counters.get("main"), Some(&1));
        assert_eq!(root.recursion_counters.get("worker"), None);
        assert_eq!(child.recursion_counters.get("main"), Some(&2));
    }

    #[test]
    fn depth_limit_honors_hard_ceiling() {
        let mut ctx = DelegateContext::root("a").with_max_depth(50);
        assert!(!ctx.at_depth_limit());
        ctx.depth = HARD_MAX_DELEGATION_DEPTH;
        assert!(ctx.at_depth_limit());
    }

    #[test]
    fn detects_chain_membership() {
        let ctx = DelegateContext::root("main").for_child("worker");
        assert!(ctx.contains("main"));
        assert!(ctx.contains("worker"));
        assert!(!ctx.contains("other"));
    }
}
