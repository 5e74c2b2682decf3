//! The per-turn LLM orchestrator.
//!
//! One orchestrator drives one conversational turn to completion: it calls
//! the provider, executes requested tool calls against its registry, feeds
//! results back, and loops until the model produces text or the iteration
//! bound is hit. Route-decision turns are capped to a single tool-less call
//! and keep their output out of the event stream.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{AgentEvent, emit};
use crate::message::Message;
use crate::pda::PromptOutcome;
use crate::provider::{ChatProvider, ChatRequest};
use crate::tool::{CallContext, ToolRegistry};
use crate::usage::Usage;

/// Default bound on provider/tool iterations within one turn.
pub(crate) const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Drives one agent turn against a provider and a tool registry.
pub struct Orchestrator {
    agent: String,
    model: String,
    provider: Arc<dyn ChatProvider>,
    registry: ToolRegistry,
    system_prompt: Option<String>,
    max_iterations: usize,
    /// Suppress content events; set for route-decision turns whose output
    /// is internal.
    quiet: bool,
}

impl Orchestrator {
    /// Create an orchestrator for one turn.
    #[must_use]
    pub fn new(
        agent: impl Into<String>,
        model: impl Into<String>,
        provider: Arc<dyn ChatProvider>,
        registry: ToolRegistry,
    ) -> Self {
        Self {
            agent: agent.into(),
            model: model.into(),
            provider,
            registry,
            system_prompt: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            quiet: false,
        }
    }

    /// Set the system prompt prepended to the conversation.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Bound the provider/tool loop.
    #[must_use]
    pub const fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Keep this turn's output out of the event stream.
    #[must_use]
    pub const fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// The registry this orchestrator dispatches tools against.
    #[must_use]
    pub const fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the turn to completion.
    ///
    /// `injected` messages (typically the PDA frame context) sit between
    /// the system prompt and the user input. The returned
    /// [`PromptOutcome::messages`] holds the new user/assistant round plus
    /// any tool traffic, ready to append to the frame context.
    pub async fn run(&self, ctx: &CallContext, injected: &[Message], input: &str) -> Result<PromptOutcome> {
        let mut messages = Vec::with_capacity(injected.len() + 2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system));
        }
        messages.extend_from_slice(injected);
        messages.push(Message::user(input));

        let mut new_messages = vec![Message::user(input)];
        let mut usage = Usage::zero();
        let definitions = self.registry.definitions();

        for iteration in 1..=self.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(Error::interrupted("context cancelled"));
            }

            debug!(agent = %self.agent, iteration, "Provider call");
            let response = self
                .provider
                .chat(&ChatRequest {
                    model: self.model.clone(),
                    messages: messages.clone(),
                    tools: definitions.clone(),
                })
                .await?;
            usage += response.usage;

            let text = response.text.clone().unwrap_or_default();

            if response.tool_calls.is_empty() {
                if !self.quiet && !text.is_empty() {
                    emit(
                        ctx.sink.as_ref(),
                        AgentEvent::Content {
                            agent: self.agent.clone(),
                            text: text.clone(),
                        },
                    );
                }
                new_messages.push(Message::assistant(&text));
                return Ok(PromptOutcome {
                    text,
                    usage,
                    messages: new_messages,
                });
            }

            if !text.is_empty() {
                if !self.quiet {
                    emit(
                        ctx.sink.as_ref(),
                        AgentEvent::Content {
                            agent: self.agent.clone(),
                            text: text.clone(),
                        },
                    );
                }
                let assistant = Message::assistant(&text);
                messages.push(assistant.clone());
                new_messages.push(assistant);
            }

            for call in &response.tool_calls {
                emit(
                    ctx.sink.as_ref(),
                    AgentEvent::ToolCallStarted {
                        agent: self.agent.clone(),
                        tool: call.name.clone(),
                    },
                );

                let (content, is_error) =
                    match self.registry.call(&call.name, ctx, call.arguments.clone()).await {
                        Ok(value) => (
                            serde_json::to_string(&value).unwrap_or_else(|_| value.to_string()),
                            false,
                        ),
                        Err(e) => {
                            warn!(agent = %self.agent, tool = %call.name, error = %e, "Tool call failed");
                            (format!("Tool error: {e}"), true)
                        }
                    };

                emit(
                    ctx.sink.as_ref(),
                    AgentEvent::ToolCallCompleted {
                        agent: self.agent.clone(),
                        tool: call.name.clone(),
                        is_error,
                    },
                );

                let result = Message::tool(&call.id, content);
                messages.push(result.clone());
                new_messages.push(result);
            }
        }

        Err(Error::resource_exhausted(
            "iterations",
            format!(
                "agent '{}' did not produce a final answer within {} iterations",
                self.agent, self.max_iterations
            ),
        ))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agent", &self.agent)
            .field("model", &self.model)
            .field("max_iterations", &self.max_iterations)
            .field("quiet", &self.quiet)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::delegate::DelegateContext;
    use crate::error::ToolError;
    use crate::provider::{ChatResponse, MockProvider, ToolCall};
    use crate::tool::Tool;

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> String {
            "Uppercases text.".to_string()
        }

        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn invoke(
            &self,
            _ctx: &CallContext,
            args: Value,
        ) -> std::result::Result<Value, ToolError> {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments("missing 'text'".to_string()))?;
            Ok(Value::String(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back() {
        let provider = Arc::new(MockProvider::with_script(vec![
            ChatResponse {
                text: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "upper".to_string(),
                    arguments: serde_json::json!({"text": "hello"}),
                }],
                usage: Usage::new(5, 5),
            },
            ChatResponse::text_reply("done: HELLO", Usage::new(3, 3)),
        ]));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(UpperTool));

        let orchestrator = Orchestrator::new("main", "test-model", provider.clone(), registry);
        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let outcome = orchestrator.run(&ctx, &[], "uppercase hello").await.unwrap();

        assert_eq!(outcome.text, "done: HELLO");
        assert_eq!(outcome.usage.total_tokens, 16);
        // user + tool result + assistant
        assert_eq!(outcome.messages.len(), 3);

        let second = &provider.requests()[1];
        assert!(second.messages.iter().any(|m| m.content.contains("HELLO")));
    }

    #[tokio::test]
    async fn tool_errors_surface_as_data() {
        let provider = Arc::new(MockProvider::with_script(vec![
            ChatResponse {
                text: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "missing".to_string(),
                    arguments: Value::Null,
                }],
                usage: Usage::zero(),
            },
            ChatResponse::text_reply("recovered", Usage::zero()),
        ]));

        let orchestrator =
            Orchestrator::new("main", "test-model", provider, ToolRegistry::new());
        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let outcome = orchestrator.run(&ctx, &[], "try a tool").await.unwrap();

        assert_eq!(outcome.text, "recovered");
        assert!(
            outcome
                .messages
                .iter()
                .any(|m| m.content.starts_with("Tool error:"))
        );
    }

    #[tokio::test]
    async fn iteration_bound_is_enforced() {
        let tool_call_forever = ChatResponse {
            text: None,
            tool_calls: vec![ToolCall {
                id: "c".to_string(),
                name: "missing".to_string(),
                arguments: Value::Null,
            }],
            usage: Usage::zero(),
        };
        let provider = Arc::new(MockProvider::with_script(vec![
            tool_call_forever.clone(),
            tool_call_forever,
        ]));

        let orchestrator = Orchestrator::new("main", "test-model", provider, ToolRegistry::new())
            .with_max_iterations(2);
        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let err = orchestrator.run(&ctx, &[], "loop").await.unwrap_err();
        assert!(err.to_string().contains("iterations"));
    }
}
