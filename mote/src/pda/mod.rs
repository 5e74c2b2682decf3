//! The pushdown-automaton orchestration engine.
//!
//! Agents with structured steps are driven by a deterministic stack
//! interpreter: each [`StackFrame`](frame::StackFrame) is one agent
//! invocation, steps are dispatched by variant, and a checkpoint is emitted
//! after every state transition so execution can resume after interruption.

mod checkpoint;
mod engine;
mod frame;
mod route;
mod validate;

pub use checkpoint::{
    CHECKPOINT_SCHEMA_VERSION, FrameSnapshot, InterruptInfo, PdaCheckpoint, restore_state,
};
pub use engine::{
    CheckpointFn, Engine, EngineHooks, Execution, PromptArgs, PromptFn, PromptMode, PromptOutcome,
};
pub use frame::{ExecutionState, StackFrame};
pub use route::{RouteTarget, build_route_prompt, resolve_route};
pub use validate::{Diagnostic, DiagnosticLevel, codes, has_errors, validate};
