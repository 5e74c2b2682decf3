//! Checkpoint persistence over host session metadata.
//!
//! Session metadata is an opaque JSON object owned by the host. The adapter
//! only ever performs read-modify-write on two reserved top-level keys, so
//! unrelated metadata (user id, theme, ...) is preserved across updates.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::pda::PdaCheckpoint;

use super::SessionStore;

/// Reserved metadata key holding the transient checkpoint.
pub const CHECKPOINT_KEY: &str = "pda_checkpoint";

/// Reserved metadata key holding the permanent PDA-session marker.
pub const SESSION_MARKER_KEY: &str = "pda_session";

/// Read-modify-write checkpoint adapter over a [`SessionStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn SessionStore>,
}

impl CheckpointStore {
    /// Create an adapter over the given session store.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    async fn metadata_object(&self, session_id: &str) -> Result<Map<String, Value>> {
        match self.store.metadata(session_id).await? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(Error::execution(
                format!("session:{session_id}"),
                format!("session metadata is not an object: {other}"),
            )),
        }
    }

    /// Persist a checkpoint under [`CHECKPOINT_KEY`], preserving every other
    /// metadata key.
    pub async fn save(&self, session_id: &str, checkpoint: &PdaCheckpoint) -> Result<()> {
        let mut metadata = self.metadata_object(session_id).await?;
        metadata.insert(
            CHECKPOINT_KEY.to_string(),
            serde_json::to_value(checkpoint)?,
        );
        self.store
            .set_metadata(session_id, Value::Object(metadata))
            .await
    }

    /// Load the stored checkpoint, if any.
    pub async fn load(&self, session_id: &str) -> Result<Option<PdaCheckpoint>> {
        let metadata = self.metadata_object(session_id).await?;
        let Some(raw) = metadata.get(CHECKPOINT_KEY) else {
            return Ok(None);
        };
        let checkpoint = serde_json::from_value(raw.clone())
            .map_err(|e| Error::checkpoint_invalid(format!("stored checkpoint unreadable: {e}")))?;
        Ok(Some(checkpoint))
    }

    /// Remove the stored checkpoint. A no-op when the key is absent.
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        let mut metadata = self.metadata_object(session_id).await?;
        if metadata.remove(CHECKPOINT_KEY).is_none() {
            return Ok(());
        }
        self.store
            .set_metadata(session_id, Value::Object(metadata))
            .await
    }

    /// Stamp the permanent `{agent}` marker so surfaces can recognize the
    /// session as PDA-driven even after the checkpoint is cleared.
    pub async fn mark_session(&self, session_id: &str, agent: &str) -> Result<()> {
        let mut metadata = self.metadata_object(session_id).await?;
        metadata.insert(
            SESSION_MARKER_KEY.to_string(),
            serde_json::json!({ "agent": agent }),
        );
        self.store
            .set_metadata(session_id, Value::Object(metadata))
            .await
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}
