//! The clonable tool registry.
//!
//! Each sub-runner clones the parent registry and then narrows it: filter by
//! the agent's allow-list, drop the `delegate` tool when further delegation
//! is forbidden, and stamp the owning agent's identity. Clones are
//! single-writer while in use.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::ToolError;

use super::{CallContext, Tool, ToolDefinition};

/// A named collection of tools with per-agent narrowing.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, Arc<dyn Tool>>,
    agent_id: Option<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous entry with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "Registering tool");
        self.entries.insert(name, tool);
    }

    /// Remove a tool by name. Returns whether an entry was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries.get(name).cloned()
    }

    /// Whether a tool with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names of all registered tools, in definition order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Definitions of all registered tools, in stable name order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.values().map(|t| t.definition()).collect()
    }

    /// Keep only the tools named in the allow-list.
    pub fn retain_allowed(&mut self, allowed: &[String]) {
        self.entries.retain(|name, _| allowed.iter().any(|a| a == name));
    }

    /// Stamp the owning agent's identity onto this registry.
    pub fn set_agent_id(&mut self, agent: impl Into<String>) {
        self.agent_id = Some(agent.into());
    }

    /// The owning agent's identity, if stamped.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Invoke a registered tool by name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] when no tool with the name exists,
    /// or the tool's own error.
    pub async fn call(
        &self,
        name: &str,
        ctx: &CallContext,
        args: Value,
    ) -> Result<Value, ToolError> {
        let tool = self
            .entries
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.invoke(ctx, args).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::delegate::DelegateContext;

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> String {
            format!("tool {}", self.0)
        }

        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn invoke(&self, _ctx: &CallContext, _args: Value) -> Result<Value, ToolError> {
            Ok(Value::String(self.0.to_string()))
        }
    }

    fn registry_with(names: &[&'static str]) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for n in names {
            registry.register(Arc::new(NamedTool(n)));
        }
        registry
    }

    #[test]
    fn clone_then_filter_leaves_parent_untouched() {
        let parent = registry_with(&["read", "write", "delegate"]);

        let mut child = parent.clone();
        child.retain_allowed(&["read".to_string()]);
        child.set_agent_id("worker");

        assert_eq!(child.names(), vec!["read"]);
        assert_eq!(child.agent_id(), Some("worker"));
        assert_eq!(parent.names(), vec!["delegate", "read", "write"]);
        assert_eq!(parent.agent_id(), None);
    }

    #[test]
    fn unregister_removes_single_entry() {
        let mut registry = registry_with(&["a", "b"]);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.names(), vec!["b"]);
    }

    #[tokio::test]
    async fn call_surfaces_not_found() {
        let registry = registry_with(&["a"]);
        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let err = registry
            .call("missing", &ctx, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
