//! Serializable execution snapshots.
//!
//! A checkpoint is written after every successful transition and at every
//! interrupt. Frames carry their context and cursor but not their steps:
//! steps are rebuilt from the live agent catalog on resume, so a checkpoint
//! stays valid across compatible catalog edits.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::agent::{AgentLookup, Step};
use crate::delegate::DelegateContext;
use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::usage::Usage;

use super::frame::{ExecutionState, StackFrame};

/// Current checkpoint schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Serialized form of one stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    /// Agent name; the catalog key used to rebuild steps on resume.
    pub agent: String,
    /// Step cursor at snapshot time.
    pub step_index: usize,
    /// Frame-local conversation context.
    pub context: Vec<Message>,
    /// Self-recursion count recorded on the frame.
    pub recursion_count: u32,
}

/// Metadata recorded when execution stops before completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptInfo {
    /// Why execution stopped.
    pub reason: String,
    /// The step cursor at interruption (not advanced).
    pub step: usize,
    /// The agent executing when the interrupt happened.
    pub agent: String,
}

/// A persisted snapshot of PDA execution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdaCheckpoint {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Owning session id.
    pub session_id: String,
    /// Name of the root agent.
    pub root_agent: String,
    /// Unix timestamp of snapshot creation, seconds.
    pub created_at: u64,
    /// Stack frames, bottom first.
    pub frames: Vec<FrameSnapshot>,
    /// Session-wide self-recursion counter.
    pub recursion_count: u32,
    /// Result of the last completed step.
    pub last_result: String,
    /// Audit labels of every executed step, in order.
    pub executed_steps: Vec<String>,
    /// Accumulated token usage.
    pub usage: Usage,
    /// Present when the snapshot was taken at an interrupt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptInfo>,
    /// The prompt that started the session.
    pub initial_prompt: String,
    /// The delegation envelope active at snapshot time.
    pub delegate: DelegateContext,
}

impl PdaCheckpoint {
    /// Create an empty checkpoint shell for a session.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        root_agent: impl Into<String>,
        initial_prompt: impl Into<String>,
        delegate: DelegateContext,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            session_id: session_id.into(),
            root_agent: root_agent.into(),
            created_at: unix_now(),
            frames: Vec::new(),
            recursion_count: 0,
            last_result: String::new(),
            executed_steps: Vec::new(),
            usage: Usage::zero(),
            interrupt: None,
            initial_prompt: initial_prompt.into(),
            delegate,
        }
    }

    /// Snapshot the live execution state.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        state: &ExecutionState,
        session_id: &str,
        root_agent: &str,
        last_result: &str,
        executed_steps: &[String],
        initial_prompt: &str,
        delegate: &DelegateContext,
        interrupt: Option<InterruptInfo>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            session_id: session_id.to_string(),
            root_agent: root_agent.to_string(),
            created_at: unix_now(),
            frames: state
                .frames()
                .iter()
                .map(|f| FrameSnapshot {
                    agent: f.agent.clone(),
                    step_index: f.step_index,
                    context: f.context.clone(),
                    recursion_count: f.recursion_count,
                })
                .collect(),
            recursion_count: state.recursion_count,
            last_result: last_result.to_string(),
            executed_steps: executed_steps.to_vec(),
            usage: state.usage,
            interrupt,
            initial_prompt: initial_prompt.to_string(),
            delegate: delegate.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Rebuild execution state from a checkpoint against the live catalog.
///
/// Each frame's steps are re-derived from the catalog; a stepless agent
/// gets its `exec` step re-synthesized from the frame's seed message. An
/// agent missing from the catalog, or a cursor past the current step list,
/// makes the checkpoint invalid.
pub fn restore_state(checkpoint: &PdaCheckpoint, lookup: &AgentLookup) -> Result<ExecutionState> {
    let mut frames = Vec::with_capacity(checkpoint.frames.len());

    for snapshot in &checkpoint.frames {
        let config = lookup(&snapshot.agent).ok_or_else(|| {
            Error::checkpoint_invalid(format!(
                "agent '{}' is no longer in the catalog",
                snapshot.agent
            ))
        })?;

        let steps = if config.has_steps() {
            config.steps
        } else {
            let seed = snapshot
                .context
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            vec![Step::exec(seed)]
        };

        if snapshot.step_index > steps.len() {
            return Err(Error::checkpoint_invalid(format!(
                "agent '{}' step cursor {} is out of range (steps: {})",
                snapshot.agent,
                snapshot.step_index,
                steps.len()
            )));
        }

        frames.push(StackFrame {
            agent: snapshot.agent.clone(),
            step_index: snapshot.step_index,
            steps,
            context: snapshot.context.clone(),
            recursion_count: snapshot.recursion_count,
        });
    }

    Ok(ExecutionState::from_frames(
        frames,
        checkpoint.recursion_count,
        checkpoint.usage,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCatalog, AgentConfig};

    fn catalog_with(configs: Vec<AgentConfig>) -> AgentLookup {
        let catalog = AgentCatalog::new();
        for c in configs {
            catalog.insert(c);
        }
        catalog.lookup_fn()
    }

    fn three_step_agent() -> AgentConfig {
        AgentConfig::new("main")
            .with_step(Step::prompt("a").with_label("step-0"))
            .with_step(Step::prompt("b").with_label("step-1"))
            .with_step(Step::prompt("c").with_label("step-2"))
    }

    #[test]
    fn round_trip_preserves_every_serialized_field() {
        let mut state = ExecutionState::new(StackFrame::new(
            "main",
            three_step_agent().steps,
            vec![Message::user("go"), Message::assistant("done a")],
        ));
        state.top_mut().unwrap().step_index = 1;
        state.recursion_count = 2;
        state.usage = Usage::new(10, 20);

        let cp = PdaCheckpoint::capture(
            &state,
            "s1",
            "main",
            "done a",
            &["step-0".to_string()],
            "go",
            &DelegateContext::root("main"),
            Some(InterruptInfo {
                reason: "rate limited".to_string(),
                step: 1,
                agent: "main".to_string(),
            }),
        );

        let json = serde_json::to_string(&cp).unwrap();
        let back: PdaCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(cp, back);
    }

    #[test]
    fn restore_rebuilds_steps_from_catalog() {
        let lookup = catalog_with(vec![three_step_agent()]);
        let cp = PdaCheckpoint {
            frames: vec![FrameSnapshot {
                agent: "main".to_string(),
                step_index: 1,
                context: vec![Message::user("go")],
                recursion_count: 0,
            }],
            ..PdaCheckpoint::new("s1", "main", "go", DelegateContext::root("main"))
        };

        let state = restore_state(&cp, &lookup).unwrap();
        let top = state.top().unwrap();
        assert_eq!(top.total_steps(), 3);
        assert_eq!(top.step_index, 1);
        assert_eq!(top.context.len(), 1);
    }

    #[test]
    fn restore_fails_for_missing_agent() {
        let lookup = catalog_with(vec![]);
        let cp = PdaCheckpoint {
            frames: vec![FrameSnapshot {
                agent: "ghost".to_string(),
                step_index: 0,
                context: vec![],
                recursion_count: 0,
            }],
            ..PdaCheckpoint::new("s1", "ghost", "go", DelegateContext::root("ghost"))
        };

        let err = restore_state(&cp, &lookup).unwrap_err();
        assert!(err.is_checkpoint_invalid());
    }

    #[test]
    fn restore_fails_for_out_of_range_cursor() {
        let lookup = catalog_with(vec![three_step_agent()]);
        let cp = PdaCheckpoint {
            frames: vec![FrameSnapshot {
                agent: "main".to_string(),
                step_index: 7,
                context: vec![],
                recursion_count: 0,
            }],
            ..PdaCheckpoint::new("s1", "main", "go", DelegateContext::root("main"))
        };

        let err = restore_state(&cp, &lookup).unwrap_err();
        assert!(err.is_checkpoint_invalid());
    }

    #[test]
    fn stepless_agent_resynthesizes_exec_from_seed() {
        let lookup = catalog_with(vec![AgentConfig::new("worker")]);
        let cp = PdaCheckpoint {
            frames: vec![FrameSnapshot {
                agent: "worker".to_string(),
                step_index: 0,
                context: vec![Message::user("child input")],
                recursion_count: 0,
            }],
            ..PdaCheckpoint::new("s1", "worker", "child input", DelegateContext::root("worker"))
        };

        let state = restore_state(&cp, &lookup).unwrap();
        let top = state.top().unwrap();
        assert_eq!(top.total_steps(), 1);
        assert_eq!(top.steps[0], Step::exec("child input"));
    }
}
