//! The `manage_agents` tool.
//!
//! Lets an LLM add, remove, and list agent definitions at runtime. The
//! catalog is read by the engine and the delegate tool with per-call
//! snapshots, so edits made here are visible at the next transition.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::agent::{AgentCatalog, AgentConfig};
use crate::error::ToolError;

use super::{CallContext, Tool};

/// Registry name of the agent-management tool.
pub const MANAGE_AGENTS_TOOL_NAME: &str = "manage_agents";

/// LLM-invokable agent catalog management.
pub struct ManageAgentsTool {
    catalog: AgentCatalog,
}

impl ManageAgentsTool {
    /// Create the tool over the live catalog.
    #[must_use]
    pub fn new(catalog: AgentCatalog) -> Self {
        Self { catalog }
    }
}

impl std::fmt::Debug for ManageAgentsTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManageAgentsTool").finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for ManageAgentsTool {
    fn name(&self) -> &str {
        MANAGE_AGENTS_TOOL_NAME
    }

    fn description(&self) -> String {
        "Manage the agent catalog: add or update an agent, remove one, or list all agents."
            .to_string()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "remove", "list"],
                    "description": "The catalog operation to perform."
                },
                "agent": {
                    "type": "object",
                    "description": "Agent definition for 'add' (name, description, steps, ...)."
                },
                "name": {
                    "type": "string",
                    "description": "Agent name for 'remove'."
                }
            },
            "required": ["action"]
        })
    }

    async fn invoke(&self, _ctx: &CallContext, args: Value) -> Result<Value, ToolError> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("'action' must be a string".to_string()))?;

        match action {
            "add" => {
                let definition = args.get("agent").cloned().ok_or_else(|| {
                    ToolError::InvalidArguments("'agent' is required for add".to_string())
                })?;
                let config: AgentConfig = serde_json::from_value(definition)
                    .map_err(|e| ToolError::InvalidArguments(format!("invalid agent: {e}")))?;
                if config.name.is_empty() {
                    return Err(ToolError::InvalidArguments(
                        "agent name must not be empty".to_string(),
                    ));
                }
                let name = config.name.clone();
                self.catalog.insert(config);
                info!(agent = %name, "Agent added to catalog");
                Ok(Value::String(format!("agent '{name}' registered")))
            }
            "remove" => {
                let name = args.get("name").and_then(Value::as_str).ok_or_else(|| {
                    ToolError::InvalidArguments("'name' is required for remove".to_string())
                })?;
                match self.catalog.remove(name) {
                    Some(_) => {
                        info!(agent = %name, "Agent removed from catalog");
                        Ok(Value::String(format!("agent '{name}' removed")))
                    }
                    None => Err(ToolError::Execution(format!("agent '{name}' not found"))),
                }
            }
            "list" => {
                let names = self.catalog.names();
                Ok(serde_json::json!({ "agents": names }))
            }
            other => Err(ToolError::InvalidArguments(format!(
                "unknown action '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DelegateContext;

    #[tokio::test]
    async fn add_list_remove_round_trip() {
        let catalog = AgentCatalog::new();
        let tool = ManageAgentsTool::new(catalog.clone());
        let ctx = CallContext::new("s1", DelegateContext::root("main"));

        tool.invoke(
            &ctx,
            serde_json::json!({
                "action": "add",
                "agent": {"name": "scribe", "description": "writes notes"}
            }),
        )
        .await
        .unwrap();
        assert!(catalog.contains("scribe"));

        let listed = tool
            .invoke(&ctx, serde_json::json!({"action": "list"}))
            .await
            .unwrap();
        assert_eq!(listed["agents"][0], "scribe");

        tool.invoke(&ctx, serde_json::json!({"action": "remove", "name": "scribe"}))
            .await
            .unwrap();
        assert!(!catalog.contains("scribe"));
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let catalog = AgentCatalog::new();
        let tool = ManageAgentsTool::new(catalog);
        let ctx = CallContext::new("s1", DelegateContext::root("main"));

        let err = tool
            .invoke(&ctx, serde_json::json!({"action": "add"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let err = tool
            .invoke(&ctx, serde_json::json!({"action": "remove", "name": "ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
