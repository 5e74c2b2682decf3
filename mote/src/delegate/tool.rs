//! The `delegate` tool.
//!
//! Surfaced to agents that may spawn sub-agents. Every guard failure is
//! returned as an error-typed tool result carrying the delegation chain,
//! so the LLM observes it as data and can pick a different agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::agent::AgentCatalog;
use crate::error::ToolError;
use crate::runner::SubRunnerFactory;
use crate::tool::{CallContext, Tool};

use super::context::HARD_MAX_DELEGATION_DEPTH;

/// Registry name of the delegate tool.
pub const DELEGATE_TOOL_NAME: &str = "delegate";

/// LLM-invokable delegation to another agent in the catalog.
pub struct DelegateTool {
    catalog: AgentCatalog,
    runner: Arc<SubRunnerFactory>,
}

impl DelegateTool {
    /// Create the tool over the live catalog and the sub-runner factory.
    #[must_use]
    pub fn new(catalog: AgentCatalog, runner: Arc<SubRunnerFactory>) -> Self {
        Self { catalog, runner }
    }
}

impl std::fmt::Debug for DelegateTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateTool").finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> String {
        "Delegate a task to another agent. The agent runs independently and returns its result."
            .to_string()
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Name of the agent to delegate to."
                },
                "prompt": {
                    "type": "string",
                    "description": "The task for the agent, with all necessary context."
                }
            },
            "required": ["agent", "prompt"]
        })
    }

    async fn invoke(&self, ctx: &CallContext, args: Value) -> Result<Value, ToolError> {
        let agent = args
            .get("agent")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("'agent' must be a string".to_string()))?
            .to_string();
        let prompt = args
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("'prompt' must be a string".to_string()))?
            .to_string();

        // The tool is the first boundary that can see the owning session.
        let mut envelope = ctx.delegate.clone();
        if envelope.parent_session.is_none() {
            envelope.parent_session = Some(ctx.session_id.clone());
        }

        if envelope.at_depth_limit() {
            return Err(ToolError::Denied(format!(
                "delegation depth limit reached (depth {}, max {}, hard cap {}); chain: {}",
                envelope.depth,
                envelope.max_depth,
                HARD_MAX_DELEGATION_DEPTH,
                envelope.chain_display()
            )));
        }

        // Agents are hot-mutable; read the catalog on every call.
        let Some(target) = self.catalog.get(&agent) else {
            return Err(ToolError::Denied(format!(
                "unknown agent '{agent}'; chain: {}",
                envelope.chain_display()
            )));
        };

        if envelope.contains(&agent) {
            return Err(ToolError::Denied(format!(
                "circular delegation: '{agent}' is already in the chain {}",
                envelope.chain_display()
            )));
        }

        if let Some(limit) = target.max_depth
            && envelope.depth + 1 > limit
        {
            return Err(ToolError::Denied(format!(
                "agent '{agent}' caps delegation depth at {limit} (current depth {})",
                envelope.depth
            )));
        }

        let child = envelope.for_child(&agent);
        debug!(chain = %child.chain_display(), "Delegation approved");

        let child_ctx = CallContext {
            session_id: ctx.session_id.clone(),
            delegate: child,
            cancel: ctx.cancel.clone(),
            sink: ctx.sink.clone(),
        };
        let sink = ctx.sink.clone();

        let run = self
            .runner
            .run_delegate_with_events(child_ctx, &agent, &prompt, sink)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        info!(agent = %agent, session = %run.session_id, "Delegation completed");
        Ok(Value::String(run.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::delegate::DelegateContext;
    use crate::provider::{MockProvider, ProviderPool};
    use crate::runner::SubRunnerFactoryBuilder;
    use crate::store::MemorySessionStore;

    fn fixture(reply: &str) -> (AgentCatalog, DelegateTool) {
        let catalog = AgentCatalog::new();
        let providers = Arc::new(ProviderPool::new("test-model"));
        providers.register("test-model", Arc::new(MockProvider::with_reply(reply)));
        let factory = SubRunnerFactoryBuilder::new(
            providers,
            catalog.clone(),
            Arc::new(MemorySessionStore::new()),
        )
        .build();
        let tool = DelegateTool::new(catalog.clone(), factory);
        (catalog, tool)
    }

    #[tokio::test]
    async fn delegates_to_known_agent() {
        let (catalog, tool) = fixture("delegated-result");
        catalog.insert(AgentConfig::new("worker"));

        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let out = tool
            .invoke(
                &ctx,
                serde_json::json!({"agent": "worker", "prompt": "do it"}),
            )
            .await
            .unwrap();
        assert_eq!(out, Value::String("delegated-result".to_string()));
    }

    #[tokio::test]
    async fn rejects_circular_delegation_with_chain() {
        let (catalog, tool) = fixture("unused");
        catalog.insert(AgentConfig::new("main"));

        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let err = tool
            .invoke(
                &ctx,
                serde_json::json!({"agent": "main", "prompt": "loop"}),
            )
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("circular"));
        assert!(message.contains("main"));
    }

    #[tokio::test]
    async fn rejects_unknown_agent() {
        let (_catalog, tool) = fixture("unused");
        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let err = tool
            .invoke(
                &ctx,
                serde_json::json!({"agent": "ghost", "prompt": "boo"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Denied(_)));
    }

    #[tokio::test]
    async fn enforces_depth_limits() {
        let (catalog, tool) = fixture("unused");
        catalog.insert(AgentConfig::new("worker"));

        let mut envelope = DelegateContext::root("main").with_max_depth(1);
        envelope.depth = 1;
        let ctx = CallContext::new("s1", envelope);
        let err = tool
            .invoke(
                &ctx,
                serde_json::json!({"agent": "worker", "prompt": "too deep"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("depth limit"));
    }

    #[tokio::test]
    async fn honors_per_agent_depth_cap() {
        let (catalog, tool) = fixture("unused");
        catalog.insert(AgentConfig::new("shallow").with_max_depth(0));

        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let err = tool
            .invoke(
                &ctx,
                serde_json::json!({"agent": "shallow", "prompt": "go"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("caps delegation depth"));
    }
}
