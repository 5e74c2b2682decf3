//! A scriptable provider for tests and offline embedding.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::usage::Usage;

use super::{ChatProvider, ChatRequest, ChatResponse};

/// A provider that replays a scripted sequence of responses.
///
/// When the script runs dry the last configured reply repeats, so simple
/// tests can configure a single response.
#[derive(Debug, Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    fallback: Option<ChatResponse>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    /// A provider that always returns the given text.
    #[must_use]
    pub fn with_reply(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(ChatResponse::text_reply(text, Usage::new(1, 1))),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that replays the given responses in order.
    #[must_use]
    pub fn with_script(responses: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue an error response.
    pub fn push_error(&self, error: Error) {
        self.script
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(error));
    }

    /// Queue a response.
    pub fn push_response(&self, response: ChatResponse) {
        self.script
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(response));
    }

    /// Requests observed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push(request.clone());

        if let Some(next) = self.script.lock().expect("mock lock poisoned").pop_front() {
            return next;
        }
        self.fallback
            .clone()
            .ok_or_else(|| Error::execution("mock provider", "script exhausted"))
    }
}
