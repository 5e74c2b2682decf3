//! LLM provider interfaces.
//!
//! Provider protocols are out of scope for the runtime; the orchestrator
//! consumes them through [`ChatProvider`]. The [`ProviderPool`] resolves an
//! agent's model to a provider, falling back to the live default.

mod mock;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::tool::ToolDefinition;
use crate::usage::Usage;

pub use mock::MockProvider;

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// JSON arguments.
    pub arguments: Value,
}

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Full conversation, system prompt first.
    pub messages: Vec<Message>,
    /// Tools offered for this turn. Empty means a tool-less call.
    pub tools: Vec<ToolDefinition>,
}

/// One chat completion response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Text content, absent when the model only calls tools.
    pub text: Option<String>,
    /// Requested tool calls, in order.
    pub tool_calls: Vec<ToolCall>,
    /// Tokens consumed by the call.
    pub usage: Usage,
}

impl ChatResponse {
    /// A plain text response.
    #[must_use]
    pub fn text_reply(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            usage,
        }
    }
}

/// Core trait for LLM providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Execute one chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// Registry of providers keyed by model identifier.
#[derive(Default)]
pub struct ProviderPool {
    providers: RwLock<HashMap<String, Arc<dyn ChatProvider>>>,
    default_model: RwLock<String>,
}

impl ProviderPool {
    /// Create an empty pool with the given default model.
    #[must_use]
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            default_model: RwLock::new(default_model.into()),
        }
    }

    /// Register a provider for a model.
    pub fn register(&self, model: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        let mut providers = self.providers.write().expect("provider lock poisoned");
        providers.insert(model.into(), provider);
    }

    /// The current default model.
    #[must_use]
    pub fn default_model(&self) -> String {
        self.default_model
            .read()
            .expect("provider lock poisoned")
            .clone()
    }

    /// Change the default model.
    pub fn set_default_model(&self, model: impl Into<String>) {
        let mut default = self.default_model.write().expect("provider lock poisoned");
        *default = model.into();
    }

    /// Resolve a model override to `(model, provider)`, falling back to the
    /// live default when the override is absent or unknown.
    pub fn resolve(&self, model: Option<&str>) -> Result<(String, Arc<dyn ChatProvider>)> {
        let providers = self.providers.read().expect("provider lock poisoned");
        if let Some(model) = model
            && let Some(provider) = providers.get(model)
        {
            return Ok((model.to_string(), Arc::clone(provider)));
        }
        let default = self.default_model();
        providers
            .get(&default)
            .map(|p| (default.clone(), Arc::clone(p)))
            .ok_or_else(|| {
                Error::configuration(format!("no provider registered for model '{default}'"))
            })
    }
}

impl std::fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers = self.providers.read().expect("provider lock poisoned");
        f.debug_struct("ProviderPool")
            .field("models", &providers.keys().collect::<Vec<_>>())
            .field("default_model", &self.default_model())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_falls_back_to_default() {
        let pool = ProviderPool::new("base-model");
        pool.register("base-model", Arc::new(MockProvider::with_reply("hi")));

        let (model, _) = pool.resolve(Some("unknown-model")).unwrap();
        assert_eq!(model, "base-model");

        let (model, _) = pool.resolve(None).unwrap();
        assert_eq!(model, "base-model");
    }

    #[tokio::test]
    async fn resolve_fails_without_default_provider() {
        let pool = ProviderPool::new("missing");
        assert!(pool.resolve(None).is_err());
    }
}
