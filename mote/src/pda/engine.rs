//! The PDA execution engine.
//!
//! [`Engine::execute`] drives an agent to completion (empty stack) or
//! failure. The engine is strictly sequential within one call: it checks
//! cancellation at the top of every iteration, dispatches the top frame's
//! current step by variant, and emits a checkpoint after every transition.
//! LLM turns happen through the injected prompt callback; the engine itself
//! never talks to a provider.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentConfig, AgentLookup, Step};
use crate::delegate::DelegateContext;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::usage::Usage;

use super::checkpoint::{InterruptInfo, PdaCheckpoint, restore_state};
use super::frame::{ExecutionState, StackFrame};
use super::route::{RouteTarget, build_route_prompt, resolve_route};
use super::validate::{DiagnosticLevel, has_errors, validate};

/// Self-recursion bound applied when an agent leaves `max_recursion` unset
/// at execution time.
const DEFAULT_MAX_RECURSION: u32 = 10;

/// Upper clamp on any configured self-recursion bound.
const RECURSION_HARD_CAP: u32 = 100;

/// How a prompt-callback invocation should be orchestrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// A workflow turn under engine control: the full tool loop runs, but
    /// the generic `delegate` tool is stripped so the engine retains sole
    /// delegation authority.
    PdaManaged,
    /// A route decision: a single LLM call, no tools, output kept out of
    /// the transcript.
    RouteOnly,
    /// The synthesized turn of a stepless agent: full tool loop.
    Exec,
}

/// Arguments handed to the injected prompt callback.
#[derive(Debug, Clone)]
pub struct PromptArgs {
    /// Agent being executed.
    pub agent: String,
    /// The frame's conversation context at dispatch time.
    pub context: Vec<Message>,
    /// The step's content, passed as user input.
    pub input: String,
    /// Orchestration mode for the turn.
    pub mode: PromptMode,
}

/// What the prompt callback returns.
#[derive(Debug, Clone, Default)]
pub struct PromptOutcome {
    /// The assistant's final text for the turn.
    pub text: String,
    /// Tokens consumed by the turn.
    pub usage: Usage,
    /// Messages to append to the frame context verbatim, typically one
    /// user/assistant round.
    pub messages: Vec<Message>,
}

/// Injected prompt callback.
pub type PromptFn =
    Arc<dyn Fn(PromptArgs) -> BoxFuture<'static, Result<PromptOutcome>> + Send + Sync>;

/// Injected checkpoint persistence callback.
pub type CheckpointFn =
    Arc<dyn Fn(PdaCheckpoint) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Optional transition callbacks driving UI progress. Expected to be cheap
/// and non-blocking.
#[derive(Default)]
pub struct EngineHooks {
    /// Fired before a step dispatch: `(agent, step index, total steps)`.
    pub on_step_start: Option<Box<dyn Fn(&str, usize, usize) + Send + Sync>>,
    /// Fired after a step completes: `(agent, step index, label)`.
    pub on_step_complete: Option<Box<dyn Fn(&str, usize, &str) + Send + Sync>>,
    /// Fired after a child frame is pushed: `(agent, stack depth)`.
    pub on_stack_push: Option<Box<dyn Fn(&str, usize) + Send + Sync>>,
    /// Fired after a frame pops: `(agent, stack depth)`.
    pub on_stack_pop: Option<Box<dyn Fn(&str, usize) + Send + Sync>>,
}

impl std::fmt::Debug for EngineHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHooks")
            .field("on_step_start", &self.on_step_start.is_some())
            .field("on_step_complete", &self.on_step_complete.is_some())
            .field("on_stack_push", &self.on_stack_push.is_some())
            .field("on_stack_pop", &self.on_stack_pop.is_some())
            .finish()
    }
}

/// Result of a completed execution.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Output of the last executed step of the root frame.
    pub result: String,
    /// Total tokens consumed.
    pub usage: Usage,
    /// Audit labels of every executed step, in order.
    pub executed_steps: Vec<String>,
}

/// The stack interpreter for one session.
pub struct Engine {
    session_id: String,
    prompt: PromptFn,
    lookup: AgentLookup,
    checkpoint: Option<CheckpointFn>,
    max_stack_depth: usize,
    hooks: EngineHooks,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.session_id)
            .field("max_stack_depth", &self.max_stack_depth)
            .finish_non_exhaustive()
    }
}

/// Outcome of dispatching one step.
struct StepDispatch {
    result: String,
    usage: Usage,
    /// Set on a successful self-recursion route: the cursor restarts at 0
    /// instead of advancing.
    reset_cursor: bool,
}

impl Engine {
    /// Create an engine for the given session.
    #[must_use]
    pub fn new(session_id: impl Into<String>, prompt: PromptFn, lookup: AgentLookup) -> Self {
        Self {
            session_id: session_id.into(),
            prompt,
            lookup,
            checkpoint: None,
            max_stack_depth: 0,
            hooks: EngineHooks::default(),
        }
    }

    /// Attach a checkpoint persistence callback.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointFn) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Bound the stack depth. Zero means unlimited.
    #[must_use]
    pub const fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    /// Attach transition hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: EngineHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Drive an agent to completion or failure.
    ///
    /// With a `checkpoint`, execution resumes from the restored state.
    /// Otherwise the workflow graph is validated, the root frame is built,
    /// and its context is seeded with one user message wrapping
    /// `initial_prompt`.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        delegate: &DelegateContext,
        agent: &AgentConfig,
        initial_prompt: &str,
        checkpoint: Option<PdaCheckpoint>,
    ) -> Result<Execution> {
        let mut last_result;
        let mut executed: Vec<String>;
        let initial_prompt = match &checkpoint {
            Some(cp) => cp.initial_prompt.clone(),
            None => initial_prompt.to_string(),
        };

        let mut state = match checkpoint {
            Some(cp) => {
                info!(
                    agent = %agent.name,
                    frames = cp.frames.len(),
                    "Resuming PDA execution from checkpoint",
                );
                last_result = cp.last_result.clone();
                executed = cp.executed_steps.clone();
                restore_state(&cp, &self.lookup)?
            }
            None => {
                self.validate_fresh(agent)?;
                last_result = String::new();
                executed = Vec::new();
                let steps = effective_steps(agent, &initial_prompt);
                let root =
                    StackFrame::new(&agent.name, steps, vec![Message::user(&initial_prompt)]);
                ExecutionState::new(root)
            }
        };

        loop {
            if cancel.is_cancelled() {
                let (agent_name, step) = top_position(&state);
                self.save_checkpoint(
                    &state,
                    &agent.name,
                    &last_result,
                    &executed,
                    &initial_prompt,
                    delegate,
                    Some(InterruptInfo {
                        reason: "context cancelled".to_string(),
                        step,
                        agent: agent_name,
                    }),
                )
                .await;
                return Err(Error::interrupted("context cancelled"));
            }

            if state.is_empty() {
                break;
            }

            if self.max_stack_depth > 0 && state.depth() > self.max_stack_depth {
                let (agent_name, step) = top_position(&state);
                let message = format!(
                    "stack depth {} exceeds the configured maximum {}",
                    state.depth(),
                    self.max_stack_depth
                );
                self.save_checkpoint(
                    &state,
                    &agent.name,
                    &last_result,
                    &executed,
                    &initial_prompt,
                    delegate,
                    Some(InterruptInfo {
                        reason: message.clone(),
                        step,
                        agent: agent_name,
                    }),
                )
                .await;
                return Err(Error::resource_exhausted("stack depth", message));
            }

            let top = state.top().expect("non-empty stack has a top frame");
            if top.is_exhausted() {
                let popped = state.pop().expect("checked non-empty");
                if let Some(cb) = &self.hooks.on_stack_pop {
                    cb(&popped.agent, state.depth());
                }

                let Some(parent) = state.top_mut() else {
                    // The root frame popped: execution is complete.
                    debug!(agent = %popped.agent, "Root frame popped, execution complete");
                    break;
                };

                // The only upward communication: inject the child's result
                // into the parent as a single assistant message.
                if !last_result.is_empty() {
                    parent.context.push(Message::assistant(format!(
                        "[{} result]: {last_result}",
                        popped.agent
                    )));
                }
                parent.step_index += 1;
                self.save_checkpoint(
                    &state,
                    &agent.name,
                    &last_result,
                    &executed,
                    &initial_prompt,
                    delegate,
                    None,
                )
                .await;
                continue;
            }

            let step = top.current_step().expect("cursor within bounds").clone();
            let step_index = top.step_index;
            let frame_agent = top.agent.clone();
            let total_steps = top.total_steps();

            if let Some(cb) = &self.hooks.on_step_start {
                cb(&frame_agent, step_index, total_steps);
            }
            debug!(
                agent = %frame_agent,
                step = step_index,
                kind = step.kind(),
                "Dispatching step",
            );

            let depth_before = state.depth();
            let dispatch = self.dispatch(&mut state, &step, &last_result).await;

            let dispatch = match dispatch {
                Ok(d) => d,
                Err(e) => {
                    let reason = e.to_string();
                    self.save_checkpoint(
                        &state,
                        &agent.name,
                        &last_result,
                        &executed,
                        &initial_prompt,
                        delegate,
                        Some(InterruptInfo {
                            reason: reason.clone(),
                            step: step_index,
                            agent: frame_agent.clone(),
                        }),
                    )
                    .await;
                    return Err(Error::execution_with_source(
                        format!("{frame_agent}:{step_index}"),
                        format!(
                            "step {step_index} of agent '{frame_agent}' failed after {} completed steps: {reason}",
                            executed.len()
                        ),
                        e,
                    ));
                }
            };

            state.usage += dispatch.usage;

            if state.depth() > depth_before {
                // A child was pushed; it must execute before the parent's
                // cursor moves or the label is recorded.
                continue;
            }

            last_result = dispatch.result;
            let label = step
                .label()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{frame_agent}:{step_index}"));
            executed.push(label.clone());
            if let Some(cb) = &self.hooks.on_step_complete {
                cb(&frame_agent, step_index, &label);
            }

            let top = state.top_mut().expect("frame survives its own step");
            top.step_index = if dispatch.reset_cursor {
                0
            } else {
                top.step_index + 1
            };

            self.save_checkpoint(
                &state,
                &agent.name,
                &last_result,
                &executed,
                &initial_prompt,
                delegate,
                None,
            )
            .await;
        }

        info!(
            agent = %agent.name,
            steps = executed.len(),
            usage = %state.usage,
            "PDA execution completed",
        );

        Ok(Execution {
            result: last_result,
            usage: state.usage,
            executed_steps: executed,
        })
    }

    /// Validate the declared graph; error diagnostics abort, warnings log.
    fn validate_fresh(&self, agent: &AgentConfig) -> Result<()> {
        if !agent.has_steps() {
            // A stepless agent runs a synthesized exec step; there is no
            // declared graph to validate.
            return Ok(());
        }
        let diagnostics = validate(agent, &self.lookup);
        for d in &diagnostics {
            match d.level {
                DiagnosticLevel::Warning => {
                    warn!(agent = %d.agent, code = d.code, "{}", d.message);
                }
                DiagnosticLevel::Error => {}
            }
        }
        if has_errors(&diagnostics) {
            let joined = diagnostics
                .iter()
                .filter(|d| d.level == DiagnosticLevel::Error)
                .map(|d| format!("[{}] {}", d.code, d.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::validation(&agent.name, joined));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        state: &mut ExecutionState,
        step: &Step,
        last_result: &str,
    ) -> Result<StepDispatch> {
        match step {
            Step::Prompt { content, .. } => {
                self.dispatch_prompt(state, content, PromptMode::PdaManaged)
                    .await
            }
            Step::Exec { content, .. } => {
                self.dispatch_prompt(state, content, PromptMode::Exec).await
            }
            Step::AgentRef { agent, content, .. } => {
                self.dispatch_agent_ref(state, agent, content, last_result)
            }
            Step::Route {
                prompt, branches, ..
            } => self.dispatch_route(state, prompt, branches).await,
        }
    }

    /// `prompt` / `exec`: one callback turn; returned messages append to
    /// the frame context verbatim.
    async fn dispatch_prompt(
        &self,
        state: &mut ExecutionState,
        content: &str,
        mode: PromptMode,
    ) -> Result<StepDispatch> {
        let top = state.top().expect("dispatch requires a top frame");
        let outcome = (self.prompt)(PromptArgs {
            agent: top.agent.clone(),
            context: top.context.clone(),
            input: content.to_string(),
            mode,
        })
        .await?;

        let top = state.top_mut().expect("frame survives its own step");
        top.context.extend(outcome.messages);

        Ok(StepDispatch {
            result: outcome.text,
            usage: outcome.usage,
            reset_cursor: false,
        })
    }

    /// `agent_ref`: push a child frame seeded with the step content plus a
    /// reference to the previous step's result.
    fn dispatch_agent_ref(
        &self,
        state: &mut ExecutionState,
        target: &str,
        content: &str,
        last_result: &str,
    ) -> Result<StepDispatch> {
        let config = (self.lookup)(target).ok_or_else(|| {
            Error::execution(
                format!("agent_ref:{target}"),
                format!("agent '{target}' not found in catalog"),
            )
        })?;

        let mut child_input = content.to_string();
        if !last_result.is_empty() {
            if !child_input.is_empty() {
                child_input.push_str("\n\n");
            }
            child_input.push_str(&format!("[previous result]: {last_result}"));
        }

        let steps = effective_steps(&config, &child_input);
        let frame = StackFrame::new(target, steps, vec![Message::user(&child_input)]);
        state.push(frame);
        if let Some(cb) = &self.hooks.on_stack_push {
            cb(target, state.depth());
        }

        Ok(StepDispatch {
            result: String::new(),
            usage: Usage::zero(),
            reset_cursor: false,
        })
    }

    /// `route`: one tool-less LLM call, deterministic branch resolution,
    /// then terminate, self-recurse, or push the chosen agent.
    async fn dispatch_route(
        &self,
        state: &mut ExecutionState,
        prompt: &str,
        branches: &std::collections::BTreeMap<String, String>,
    ) -> Result<StepDispatch> {
        let top = state.top().expect("dispatch requires a top frame");
        let frame_agent = top.agent.clone();
        let route_prompt = build_route_prompt(prompt, branches);

        let outcome = (self.prompt)(PromptArgs {
            agent: frame_agent.clone(),
            context: top.context.clone(),
            input: route_prompt,
            mode: PromptMode::RouteOnly,
        })
        .await?;

        let top = state.top_mut().expect("frame survives its own step");
        top.context.extend(outcome.messages);
        let reply = outcome.text.trim().to_string();

        match resolve_route(&reply, branches) {
            RouteTarget::End => {
                debug!(agent = %frame_agent, "Route terminated via _end");
                Ok(StepDispatch {
                    result: reply,
                    usage: outcome.usage,
                    reset_cursor: false,
                })
            }

            RouteTarget::Branch { key, target } if target == frame_agent => {
                state.recursion_count += 1;
                let max = (self.lookup)(&frame_agent)
                    .map(|c| c.max_recursion)
                    .unwrap_or(0);
                let max = if max == 0 {
                    DEFAULT_MAX_RECURSION
                } else {
                    max.min(RECURSION_HARD_CAP)
                };
                if state.recursion_count > max {
                    return Err(Error::resource_exhausted(
                        "recursion limit",
                        format!(
                            "agent '{frame_agent}' exceeded max_recursion {max} via branch '{key}'"
                        ),
                    ));
                }
                debug!(
                    agent = %frame_agent,
                    count = state.recursion_count,
                    "Self-recursion route taken",
                );
                let count = state.recursion_count;
                let top = state.top_mut().expect("frame survives its own step");
                top.recursion_count = count;
                Ok(StepDispatch {
                    result: reply,
                    usage: outcome.usage,
                    reset_cursor: true,
                })
            }

            RouteTarget::Branch { target, .. } => {
                let config = (self.lookup)(&target).ok_or_else(|| {
                    Error::execution(
                        format!("route:{target}"),
                        format!("route target '{target}' not found in catalog"),
                    )
                })?;

                // The chosen sub-agent inherits the full parent context so
                // it sees the prior discussion.
                let context = state
                    .top()
                    .expect("dispatch requires a top frame")
                    .context
                    .clone();
                let steps = effective_steps(&config, "");
                let frame = StackFrame::new(&target, steps, context);
                state.push(frame);
                if let Some(cb) = &self.hooks.on_stack_push {
                    cb(&target, state.depth());
                }

                Ok(StepDispatch {
                    result: String::new(),
                    usage: outcome.usage,
                    reset_cursor: false,
                })
            }

            RouteTarget::NoMatch => Err(Error::execution(
                format!("route:{frame_agent}"),
                format!("no route branch matched reply '{reply}' and no '_default' exists"),
            )),
        }
    }

    async fn save_checkpoint(
        &self,
        state: &ExecutionState,
        root_agent: &str,
        last_result: &str,
        executed: &[String],
        initial_prompt: &str,
        delegate: &DelegateContext,
        interrupt: Option<InterruptInfo>,
    ) {
        let Some(cb) = &self.checkpoint else {
            return;
        };
        let cp = PdaCheckpoint::capture(
            state,
            &self.session_id,
            root_agent,
            last_result,
            executed,
            initial_prompt,
            delegate,
            interrupt,
        );
        if let Err(e) = cb(cp).await {
            // Persistence failures never mask the step outcome.
            warn!(error = %e, session = %self.session_id, "Checkpoint save failed");
        }
    }
}

/// The agent's declared steps, or the synthesized `exec` wrapper for a
/// stepless agent.
fn effective_steps(config: &AgentConfig, input: &str) -> Vec<Step> {
    if config.has_steps() {
        config.steps.clone()
    } else {
        vec![Step::exec(input)]
    }
}

fn top_position(state: &ExecutionState) -> (String, usize) {
    state
        .top()
        .map(|f| (f.agent.clone(), f.step_index))
        .unwrap_or_default()
}
