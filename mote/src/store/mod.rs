//! Host storage interfaces and reference in-memory implementations.
//!
//! The runtime never owns persistence. Session metadata, the sandbox
//! key-value surface, and skill configuration are all consumed through the
//! narrow traits here; the host wires real backends in production and the
//! in-memory implementations serve tests and embedding.

mod checkpoint;
mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;

pub use checkpoint::{CHECKPOINT_KEY, CheckpointStore, SESSION_MARKER_KEY};
pub use memory::{MemoryKvStore, MemorySessionStore, MemorySkillConfigStore};

/// Host-owned session storage.
///
/// Metadata is an opaque JSON object; the runtime only ever performs
/// read-modify-write on reserved top-level keys so unrelated metadata
/// survives.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the session's metadata object. Unknown sessions yield `null`.
    async fn metadata(&self, session_id: &str) -> Result<Value>;

    /// Replace the session's metadata object.
    async fn set_metadata(&self, session_id: &str, metadata: Value) -> Result<()>;

    /// Append a message to the session transcript.
    async fn append_message(&self, session_id: &str, message: Message) -> Result<()>;
}

/// Synchronous key-value surface backing the sandbox `mote.kv` API.
pub trait KvStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value.
    fn set(&self, key: &str, value: String);

    /// Delete a value. Returns whether the key existed.
    fn delete(&self, key: &str) -> bool;
}

/// Persistence for per-skill configuration.
pub trait SkillConfigStore: Send + Sync {
    /// Load a skill's stored configuration.
    fn load(&self, skill_id: &str) -> Option<Value>;

    /// Store a skill's configuration.
    fn save(&self, skill_id: &str, config: Value);
}
