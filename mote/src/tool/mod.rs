//! Tool trait and registry.
//!
//! Tools are named capabilities an agent can invoke. Failures are returned
//! as structured [`ToolError`]s which the orchestrator renders into
//! error-typed results, so the LLM observes them as data and can react.

mod manage_agents;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::delegate::DelegateContext;
use crate::error::ToolError;
use crate::events::EventSink;

pub use manage_agents::{MANAGE_AGENTS_TOOL_NAME, ManageAgentsTool};
pub use registry::ToolRegistry;

/// A registry shared between mutators (tool loader, skill manager) and
/// readers (sub-runner factories), which snapshot it per run.
pub type SharedToolRegistry = std::sync::Arc<std::sync::RwLock<ToolRegistry>>;

/// Wrap a registry for shared mutation.
#[must_use]
pub fn shared(registry: ToolRegistry) -> SharedToolRegistry {
    std::sync::Arc::new(std::sync::RwLock::new(registry))
}

/// Definition of a tool for LLM function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool, snake_case.
    pub name: String,
    /// Description helping the model decide when to use the tool.
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-invocation context threaded into every tool call.
///
/// Carries the delegation envelope, the owning session, the cooperative
/// cancellation token, and the ambient event sink (if the parent streams).
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Session that owns this invocation.
    pub session_id: String,
    /// Delegation envelope of the calling agent.
    pub delegate: DelegateContext,
    /// Cooperative cancellation for the call tree.
    pub cancel: CancellationToken,
    /// Ambient parent sink; `None` means a non-streaming run.
    pub sink: Option<EventSink>,
}

impl CallContext {
    /// Create a context for the given session and envelope.
    #[must_use]
    pub fn new(session_id: impl Into<String>, delegate: DelegateContext) -> Self {
        Self {
            session_id: session_id.into(),
            delegate,
            cancel: CancellationToken::new(),
            sink: None,
        }
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach an event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// The core trait for all tools agents can use.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the name of the tool.
    fn name(&self) -> &str;

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Get the tool definition for LLM function calling.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }

    /// Execute the tool with JSON arguments.
    async fn invoke(&self, ctx: &CallContext, args: Value) -> Result<Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> String {
            "Echoes back the input message.".to_string()
        }

        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" }
                },
                "required": ["message"]
            })
        }

        async fn invoke(&self, _ctx: &CallContext, args: Value) -> Result<Value, ToolError> {
            args.get("message")
                .cloned()
                .ok_or_else(|| ToolError::InvalidArguments("missing 'message'".to_string()))
        }
    }

    #[tokio::test]
    async fn definition_reflects_tool_metadata() {
        let tool = EchoTool;
        let def = tool.definition();
        assert_eq!(def.name, "echo");
        assert!(def.parameters.is_object());

        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let out = tool
            .invoke(&ctx, serde_json::json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!("hi"));
    }
}
