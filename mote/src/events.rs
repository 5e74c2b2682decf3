//! Events emitted during agent execution.
//!
//! Sub-runners fan these out to an optional sink so an external transport
//! can observe progress in real time. A missing sink means a non-streaming
//! run; emission is always best-effort.

use tokio::sync::mpsc;

use crate::usage::Usage;

/// Events emitted while an agent run is in flight.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AgentEvent {
    /// A run began for the named agent.
    RunStarted {
        /// Agent name.
        agent: String,
    },

    /// Text content produced by the model.
    Content {
        /// Agent name.
        agent: String,
        /// The produced text.
        text: String,
    },

    /// A tool call is being made.
    ToolCallStarted {
        /// Agent name.
        agent: String,
        /// Name of the tool being called.
        tool: String,
    },

    /// Tool execution completed.
    ToolCallCompleted {
        /// Agent name.
        agent: String,
        /// Name of the tool.
        tool: String,
        /// Whether the tool returned an error-typed result.
        is_error: bool,
    },

    /// A workflow step began.
    StepStarted {
        /// Agent name.
        agent: String,
        /// Zero-based step index.
        step: usize,
        /// Total steps in the frame.
        total: usize,
    },

    /// A workflow step completed.
    StepCompleted {
        /// Agent name.
        agent: String,
        /// Zero-based step index.
        step: usize,
        /// Audit label recorded for the step.
        label: String,
    },

    /// Periodic liveness signal while a sub-run is open.
    Heartbeat {
        /// Agent name.
        agent: String,
        /// Seconds since the sub-run started.
        elapsed_secs: u64,
    },

    /// Token usage accumulated so far.
    UsageReport(Usage),

    /// A failure surfaced to the parent.
    Error {
        /// Agent name.
        agent: String,
        /// Human-readable failure description.
        message: String,
    },

    /// The run finished.
    RunCompleted {
        /// Agent name.
        agent: String,
    },
}

/// Sender half of an event channel; cloned into sub-runs and heartbeats.
pub type EventSink = mpsc::UnboundedSender<AgentEvent>;

/// Send an event into an optional sink, ignoring a closed receiver.
pub fn emit(sink: Option<&EventSink>, event: AgentEvent) {
    if let Some(sink) = sink {
        let _ = sink.send(event);
    }
}
