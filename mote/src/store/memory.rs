//! In-memory store implementations for tests and embedding.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;

use super::{KvStore, SessionStore, SkillConfigStore};

#[derive(Debug, Default)]
struct SessionRecord {
    metadata: Value,
    transcript: Vec<Message>,
}

/// An in-memory [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a session's transcript.
    #[must_use]
    pub fn transcript(&self, session_id: &str) -> Vec<Message> {
        let sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions
            .get(session_id)
            .map(|r| r.transcript.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn metadata(&self, session_id: &str) -> Result<Value> {
        let sessions = self.sessions.lock().expect("session store lock poisoned");
        Ok(sessions
            .get(session_id)
            .map(|r| r.metadata.clone())
            .unwrap_or(Value::Null))
    }

    async fn set_metadata(&self, session_id: &str, metadata: Value) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions.entry(session_id.to_string()).or_default().metadata = metadata;
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: Message) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        sessions
            .entry(session_id.to_string())
            .or_default()
            .transcript
            .push(message);
        Ok(())
    }
}

/// An in-memory [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().expect("kv lock poisoned");
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut values = self.values.lock().expect("kv lock poisoned");
        values.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        let mut values = self.values.lock().expect("kv lock poisoned");
        values.remove(key).is_some()
    }
}

/// An in-memory [`SkillConfigStore`].
#[derive(Debug, Default)]
pub struct MemorySkillConfigStore {
    configs: Mutex<HashMap<String, Value>>,
}

impl MemorySkillConfigStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SkillConfigStore for MemorySkillConfigStore {
    fn load(&self, skill_id: &str) -> Option<Value> {
        let configs = self.configs.lock().expect("config lock poisoned");
        configs.get(skill_id).cloned()
    }

    fn save(&self, skill_id: &str, config: Value) {
        let mut configs = self.configs.lock().expect("config lock poisoned");
        configs.insert(skill_id.to_string(), config);
    }
}
