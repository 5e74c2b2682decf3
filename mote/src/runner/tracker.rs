//! Delegated-run tracking.

use std::sync::Mutex;

/// Records delegated sub-runs for audit surfaces.
pub trait RunTracker: Send + Sync {
    /// A sub-run started.
    fn record_start(&self, session_id: &str, agent: &str, parent_session: &str);

    /// A sub-run finished.
    fn record_finish(&self, session_id: &str, success: bool, message: &str);
}

/// One tracked sub-run row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRun {
    /// Child session id.
    pub session_id: String,
    /// Agent executed.
    pub agent: String,
    /// Spawning session.
    pub parent_session: String,
    /// Outcome, once finished.
    pub outcome: Option<(bool, String)>,
}

/// In-memory tracker for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    runs: Mutex<Vec<TrackedRun>>,
}

impl MemoryTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the tracked rows.
    #[must_use]
    pub fn runs(&self) -> Vec<TrackedRun> {
        self.runs.lock().expect("tracker lock poisoned").clone()
    }
}

impl RunTracker for MemoryTracker {
    fn record_start(&self, session_id: &str, agent: &str, parent_session: &str) {
        let mut runs = self.runs.lock().expect("tracker lock poisoned");
        runs.push(TrackedRun {
            session_id: session_id.to_string(),
            agent: agent.to_string(),
            parent_session: parent_session.to_string(),
            outcome: None,
        });
    }

    fn record_finish(&self, session_id: &str, success: bool, message: &str) {
        let mut runs = self.runs.lock().expect("tracker lock poisoned");
        if let Some(run) = runs.iter_mut().rev().find(|r| r.session_id == session_id) {
            run.outcome = Some((success, message.to_string()));
        }
    }
}
