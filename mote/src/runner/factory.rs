//! The sub-runner factory.
//!
//! Holds the shared dependencies (provider pool, catalog, parent tool
//! registry, session store, skill manager, tracker, run limits) and builds
//! per-agent execution environments: one-shot delegated runs, PDA-driven
//! runs with checkpoint resume, and per-step orchestrators.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentCatalog, AgentConfig};
use crate::delegate::DELEGATE_TOOL_NAME;
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventSink, emit};
use crate::message::Message;
use crate::pda::{
    CheckpointFn, Engine, EngineHooks, Execution, PromptArgs, PromptFn, PromptMode,
};
use crate::provider::ProviderPool;
use crate::skill::SkillManager;
use crate::store::{CheckpointStore, SessionStore};
use crate::tool::{CallContext, SharedToolRegistry, ToolRegistry, shared};
use crate::usage::Usage;

use super::orchestrator::{DEFAULT_MAX_ITERATIONS, Orchestrator};
use super::tracker::RunTracker;

/// Interval between liveness events while a sub-run is open.
const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Run-level bounds applied to every materialized environment.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    /// PDA stack depth bound; zero means unlimited.
    pub max_stack_depth: usize,
    /// Provider/tool iteration bound within one turn.
    pub max_iterations: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_stack_depth: 10,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Result of one delegated sub-run.
#[derive(Debug, Clone)]
pub struct DelegateRun {
    /// Aggregated text produced by the sub-agent.
    pub result: String,
    /// Tokens consumed by the sub-run.
    pub usage: Usage,
    /// The child session id assigned to the run.
    pub session_id: String,
}

/// Builds per-agent execution environments from shared dependencies.
pub struct SubRunnerFactory {
    providers: Arc<ProviderPool>,
    catalog: AgentCatalog,
    tools: SharedToolRegistry,
    sessions: Arc<dyn SessionStore>,
    checkpoints: CheckpointStore,
    tracker: Option<Arc<dyn RunTracker>>,
    skills: Option<Arc<SkillManager>>,
    limits: RunLimits,
}

impl std::fmt::Debug for SubRunnerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubRunnerFactory")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SubRunnerFactory`].
pub struct SubRunnerFactoryBuilder {
    providers: Arc<ProviderPool>,
    catalog: AgentCatalog,
    sessions: Arc<dyn SessionStore>,
    tools: SharedToolRegistry,
    tracker: Option<Arc<dyn RunTracker>>,
    skills: Option<Arc<SkillManager>>,
    limits: RunLimits,
}

impl std::fmt::Debug for SubRunnerFactoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubRunnerFactoryBuilder")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SubRunnerFactoryBuilder {
    /// Start a builder from the required dependencies.
    #[must_use]
    pub fn new(
        providers: Arc<ProviderPool>,
        catalog: AgentCatalog,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            providers,
            catalog,
            sessions,
            tools: shared(ToolRegistry::new()),
            tracker: None,
            skills: None,
            limits: RunLimits::default(),
        }
    }

    /// Set the shared parent registry snapshotted into every sub-run.
    #[must_use]
    pub fn tools(mut self, tools: SharedToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Attach a delegated-run tracker.
    #[must_use]
    pub fn tracker(mut self, tracker: Arc<dyn RunTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Attach a skill manager; its skills document joins system prompts.
    #[must_use]
    pub fn skills(mut self, skills: Arc<SkillManager>) -> Self {
        self.skills = Some(skills);
        self
    }

    /// Override the run limits.
    #[must_use]
    pub const fn limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the factory.
    #[must_use]
    pub fn build(self) -> Arc<SubRunnerFactory> {
        let checkpoints = CheckpointStore::new(Arc::clone(&self.sessions));
        Arc::new(SubRunnerFactory {
            providers: self.providers,
            catalog: self.catalog,
            tools: self.tools,
            sessions: self.sessions,
            checkpoints,
            tracker: self.tracker,
            skills: self.skills,
            limits: self.limits,
        })
    }
}

impl SubRunnerFactory {
    /// The live agent catalog.
    #[must_use]
    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    /// Replace the contents of the shared parent registry.
    pub fn set_tools(&self, tools: ToolRegistry) {
        *self.tools.write().expect("registry lock poisoned") = tools;
    }

    /// The shared parent registry mutated by loaders and skill managers.
    #[must_use]
    pub fn tools(&self) -> &SharedToolRegistry {
        &self.tools
    }

    /// One-shot sub-agent execution without event streaming.
    pub async fn run_delegate(
        &self,
        ctx: CallContext,
        agent_name: &str,
        prompt: &str,
    ) -> Result<DelegateRun> {
        self.run_delegate_with_events(ctx, agent_name, prompt, None)
            .await
    }

    /// One-shot sub-agent execution with an optional event sink.
    pub async fn run_delegate_with_events(
        &self,
        ctx: CallContext,
        agent_name: &str,
        prompt: &str,
        sink: Option<EventSink>,
    ) -> Result<DelegateRun> {
        let config = self.catalog.get(agent_name).ok_or_else(|| {
            Error::execution(
                format!("delegate:{agent_name}"),
                format!("agent '{agent_name}' not found in catalog"),
            )
        })?;

        let parent_session = ctx
            .delegate
            .parent_session
            .clone()
            .unwrap_or_else(|| ctx.session_id.clone());
        let child_session = format!("{parent_session}:{agent_name}:{}", unix_now());

        if let Some(tracker) = &self.tracker {
            tracker.record_start(&child_session, agent_name, &parent_session);
        }
        emit(
            sink.as_ref(),
            AgentEvent::RunStarted {
                agent: agent_name.to_string(),
            },
        );
        info!(agent = %agent_name, session = %child_session, "Delegated run started");

        let orchestrator = self.build_orchestrator_for_agent(&config, false, false)?;
        let child_ctx = CallContext {
            session_id: child_session.clone(),
            delegate: ctx.delegate.clone(),
            cancel: ctx.cancel.clone(),
            sink: sink.clone(),
        };

        let done = CancellationToken::new();
        let heartbeat = spawn_heartbeat(agent_name.to_string(), sink.clone(), done.clone());

        let run = orchestrator.run(&child_ctx, &[], prompt);
        let outcome = match config.timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok(result) => result,
                Err(_) => Err(Error::execution(
                    format!("delegate:{agent_name}"),
                    format!("agent '{agent_name}' timed out after {secs}s"),
                )),
            },
            None => run.await,
        };

        done.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }

        match outcome {
            Ok(outcome) => {
                if let Some(tracker) = &self.tracker {
                    tracker.record_finish(&child_session, true, &outcome.text);
                }
                emit(sink.as_ref(), AgentEvent::UsageReport(outcome.usage));
                emit(
                    sink.as_ref(),
                    AgentEvent::RunCompleted {
                        agent: agent_name.to_string(),
                    },
                );
                Ok(DelegateRun {
                    result: outcome.text,
                    usage: outcome.usage,
                    session_id: child_session,
                })
            }
            Err(e) => {
                let friendly = friendly_error_message(agent_name, &e);
                if let Some(tracker) = &self.tracker {
                    tracker.record_finish(&child_session, false, &friendly);
                }
                emit(
                    sink.as_ref(),
                    AgentEvent::Error {
                        agent: agent_name.to_string(),
                        message: friendly.clone(),
                    },
                );
                Err(Error::execution_with_source(
                    format!("delegate:{agent_name}"),
                    friendly,
                    e,
                ))
            }
        }
    }

    /// Execute an agent's structured workflow under the PDA engine,
    /// resuming from a stored checkpoint when one exists.
    pub async fn run_pda_with_events(
        &self,
        ctx: CallContext,
        agent_name: &str,
        prompt: &str,
        sink: Option<EventSink>,
    ) -> Result<Execution> {
        let config = self.catalog.get(agent_name).ok_or_else(|| {
            Error::execution(
                format!("pda:{agent_name}"),
                format!("agent '{agent_name}' not found in catalog"),
            )
        })?;

        let session_id = ctx.session_id.clone();
        self.checkpoints.mark_session(&session_id, agent_name).await?;

        let prior = match self.checkpoints.load(&session_id).await {
            Ok(prior) => prior,
            Err(e) => {
                // An unreadable checkpoint must not wedge the session.
                warn!(error = %e, session = %session_id, "Discarding unreadable checkpoint");
                self.checkpoints.clear(&session_id).await?;
                None
            }
        };

        let engine = self.build_engine(&ctx, &session_id, sink.clone());

        match engine
            .execute(&ctx.cancel, &ctx.delegate, &config, prompt, prior)
            .await
        {
            Ok(execution) => {
                self.checkpoints.clear(&session_id).await?;
                emit(
                    sink.as_ref(),
                    AgentEvent::RunCompleted {
                        agent: agent_name.to_string(),
                    },
                );
                Ok(execution)
            }
            Err(e) => {
                self.record_interruption(&session_id, agent_name, sink.as_ref())
                    .await;
                Err(e)
            }
        }
    }

    /// Assemble the engine for one PDA run: prompt callback building a
    /// fresh orchestrator per step, checkpoint persistence, progress hooks.
    fn build_engine(&self, ctx: &CallContext, session_id: &str, sink: Option<EventSink>) -> Engine {
        let checkpoint_fn: CheckpointFn = {
            let store = self.checkpoints.clone();
            let session = session_id.to_string();
            Arc::new(move |cp| {
                let store = store.clone();
                let session = session.clone();
                Box::pin(async move { store.save(&session, &cp).await })
            })
        };

        let prompt_fn = self.build_prompt_fn(ctx, sink.clone());

        let hooks = EngineHooks {
            on_step_start: sink.clone().map(|sink| {
                Box::new(move |agent: &str, step: usize, total: usize| {
                    let _ = sink.send(AgentEvent::StepStarted {
                        agent: agent.to_string(),
                        step,
                        total,
                    });
                }) as Box<dyn Fn(&str, usize, usize) + Send + Sync>
            }),
            on_step_complete: sink.map(|sink| {
                Box::new(move |agent: &str, step: usize, label: &str| {
                    let _ = sink.send(AgentEvent::StepCompleted {
                        agent: agent.to_string(),
                        step,
                        label: label.to_string(),
                    });
                }) as Box<dyn Fn(&str, usize, &str) + Send + Sync>
            }),
            on_stack_push: None,
            on_stack_pop: None,
        };

        Engine::new(session_id, prompt_fn, self.catalog.lookup_fn())
            .with_checkpoint(checkpoint_fn)
            .with_max_stack_depth(self.limits.max_stack_depth)
            .with_hooks(hooks)
    }

    /// The engine's prompt callback: a fresh orchestrator per step, the
    /// frame context injected, and every non-empty non-route output
    /// persisted to the session transcript.
    fn build_prompt_fn(&self, ctx: &CallContext, sink: Option<EventSink>) -> PromptFn {
        let catalog = self.catalog.clone();
        let providers = Arc::clone(&self.providers);
        let sessions = Arc::clone(&self.sessions);
        let skills = self.skills.clone();
        let tools = Arc::clone(&self.tools);
        let limits = self.limits;
        let ctx = ctx.clone();

        Arc::new(move |args: PromptArgs| {
            let catalog = catalog.clone();
            let providers = Arc::clone(&providers);
            let sessions = Arc::clone(&sessions);
            let skills = skills.clone();
            let tools = Arc::clone(&tools);
            let ctx = ctx.clone();
            let sink = sink.clone();

            Box::pin(async move {
                let config = catalog.get(&args.agent).unwrap_or_else(|| {
                    // A frame can outlive a catalog edit; run with an
                    // empty definition rather than failing mid-workflow.
                    AgentConfig::new(&args.agent)
                });
                let route_only = args.mode == PromptMode::RouteOnly;

                let orchestrator = build_orchestrator(
                    &providers, &tools, &skills, &config, route_only, true, limits,
                )?;

                let call_ctx = CallContext {
                    session_id: ctx.session_id.clone(),
                    delegate: ctx.delegate.clone(),
                    cancel: ctx.cancel.clone(),
                    sink: if route_only { None } else { sink.clone() },
                };

                let outcome = orchestrator.run(&call_ctx, &args.context, &args.input).await?;

                if !route_only && !outcome.text.is_empty() {
                    // The transcript reflects the workflow step by step.
                    let _ = sessions
                        .append_message(&ctx.session_id, Message::assistant(&outcome.text))
                        .await;
                }

                Ok(outcome)
            })
        })
    }

    /// Assemble the orchestrator for one step of one agent.
    ///
    /// `route_only` builds an empty tool registry and caps iterations to
    /// one; `pda_managed` strips the generic `delegate` tool so the engine
    /// retains sole delegation authority.
    pub fn build_orchestrator_for_agent(
        &self,
        config: &AgentConfig,
        route_only: bool,
        pda_managed: bool,
    ) -> Result<Orchestrator> {
        build_orchestrator(
            &self.providers,
            &self.tools,
            &self.skills,
            config,
            route_only,
            pda_managed,
            self.limits,
        )
    }

    /// Leave a human-readable recovery note in the transcript after an
    /// interrupted PDA run.
    async fn record_interruption(
        &self,
        session_id: &str,
        agent_name: &str,
        sink: Option<&EventSink>,
    ) {
        let Ok(Some(checkpoint)) = self.checkpoints.load(session_id).await else {
            return;
        };
        let Some(interrupt) = &checkpoint.interrupt else {
            return;
        };

        let total = self
            .catalog
            .get(&interrupt.agent)
            .map(|c| c.steps.len().max(1))
            .unwrap_or(1);
        let note = format!(
            "[PDA Agent {agent_name} interrupted at step {}/{total}]",
            interrupt.step + 1
        );

        let _ = self
            .sessions
            .append_message(session_id, Message::assistant(&note))
            .await;
        emit(
            sink,
            AgentEvent::Error {
                agent: agent_name.to_string(),
                message: interrupt.reason.clone(),
            },
        );
    }
}

/// Shared orchestrator assembly used by both the factory method and the
/// engine's prompt callback.
fn build_orchestrator(
    providers: &Arc<ProviderPool>,
    tools: &SharedToolRegistry,
    skills: &Option<Arc<SkillManager>>,
    config: &AgentConfig,
    route_only: bool,
    pda_managed: bool,
    limits: RunLimits,
) -> Result<Orchestrator> {
    let (model, provider) = providers.resolve(config.model.as_deref())?;

    let (registry, max_iterations) = if route_only {
        (ToolRegistry::new(), 1)
    } else {
        let mut registry = tools.read().expect("registry lock poisoned").clone();
        if let Some(allowed) = &config.tools {
            registry.retain_allowed(allowed);
        }
        if pda_managed || !config.allow_delegation {
            registry.unregister(DELEGATE_TOOL_NAME);
        }
        registry.set_agent_id(&config.name);
        (registry, limits.max_iterations)
    };

    let mut orchestrator = Orchestrator::new(&config.name, model, provider, registry)
        .with_max_iterations(max_iterations)
        .with_quiet(route_only);

    let mut parts = Vec::new();
    if let Some(system) = &config.system_prompt {
        parts.push(system.clone());
    }
    if let Some(skills) = skills {
        let xml = skills.format_skills_xml();
        if !xml.is_empty() {
            parts.push(xml);
        }
    }
    if !parts.is_empty() {
        orchestrator = orchestrator.with_system_prompt(parts.join("\n\n"));
    }

    Ok(orchestrator)
}

/// Map a sub-run failure to the message surfaced to the parent.
fn friendly_error_message(agent: &str, err: &Error) -> String {
    let raw = err.to_string();
    let lower = raw.to_lowercase();
    if lower.contains("content_filter")
        || lower.contains("content safety")
        || lower.contains("content management policy")
    {
        format!("Agent '{agent}' reply was blocked by the provider's content safety filter")
    } else {
        format!("Agent '{agent}' failed: {raw}")
    }
}

/// Emit a liveness event every 15 seconds while the sub-run is open.
fn spawn_heartbeat(
    agent: String,
    sink: Option<EventSink>,
    done: CancellationToken,
) -> Option<JoinHandle<()>> {
    let sink = sink?;
    let started = Instant::now();
    Some(tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        // The first tick fires immediately; a run that just started is alive
        // by definition.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = done.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = sink.send(AgentEvent::Heartbeat {
                        agent: agent.clone(),
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
            }
        }
    }))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DelegateContext;
    use crate::provider::MockProvider;
    use crate::runner::MemoryTracker;
    use crate::store::MemorySessionStore;

    fn base_factory(provider: MockProvider) -> (Arc<SubRunnerFactory>, Arc<MemorySessionStore>) {
        let providers = Arc::new(ProviderPool::new("test-model"));
        providers.register("test-model", Arc::new(provider));
        let catalog = AgentCatalog::new();
        let sessions = Arc::new(MemorySessionStore::new());
        let factory = SubRunnerFactoryBuilder::new(providers, catalog.clone(), sessions.clone())
            .build();
        (factory, sessions)
    }

    #[tokio::test]
    async fn delegate_run_aggregates_result_and_tracks() {
        let tracker = Arc::new(MemoryTracker::new());
        let providers = Arc::new(ProviderPool::new("test-model"));
        providers.register("test-model", Arc::new(MockProvider::with_reply("sub-result")));
        let catalog = AgentCatalog::new();
        catalog.insert(AgentConfig::new("worker").with_description("does work"));
        let factory = SubRunnerFactoryBuilder::new(
            providers,
            catalog,
            Arc::new(MemorySessionStore::new()),
        )
        .tracker(tracker.clone() as Arc<dyn RunTracker>)
        .build();

        let ctx = CallContext::new("parent-session", DelegateContext::root("main"));
        let run = factory
            .run_delegate(ctx, "worker", "do the thing")
            .await
            .unwrap();

        assert_eq!(run.result, "sub-result");
        assert!(run.session_id.starts_with("parent-session:worker:"));

        let runs = tracker.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].agent, "worker");
        assert!(runs[0].outcome.as_ref().unwrap().0);
    }

    #[tokio::test]
    async fn pda_run_persists_step_outputs_and_clears_checkpoint() {
        let provider = MockProvider::with_script(vec![
            crate::provider::ChatResponse::text_reply("first-out", Usage::new(1, 1)),
            crate::provider::ChatResponse::text_reply("second-out", Usage::new(1, 1)),
        ]);
        let (factory, sessions) = base_factory(provider);
        factory.catalog().insert(
            AgentConfig::new("flow")
                .with_step(crate::agent::Step::prompt("one"))
                .with_step(crate::agent::Step::prompt("two")),
        );

        let ctx = CallContext::new("s1", DelegateContext::root("flow"));
        let execution = factory
            .run_pda_with_events(ctx, "flow", "start", None)
            .await
            .unwrap();

        assert_eq!(execution.result, "second-out");

        let transcript = sessions.transcript("s1");
        let texts: Vec<&str> = transcript.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["first-out", "second-out"]);

        let metadata = sessions.metadata("s1").await.unwrap();
        assert!(metadata.get(crate::store::CHECKPOINT_KEY).is_none());
        assert_eq!(
            metadata[crate::store::SESSION_MARKER_KEY]["agent"],
            "flow"
        );
    }

    #[tokio::test]
    async fn interrupted_pda_run_leaves_recovery_note() {
        let provider = MockProvider::with_script(vec![crate::provider::ChatResponse::text_reply(
            "first-out",
            Usage::new(1, 1),
        )]);
        provider.push_error(Error::execution("provider", "rate limited"));
        let (factory, sessions) = base_factory(provider);
        factory.catalog().insert(
            AgentConfig::new("flow")
                .with_step(crate::agent::Step::prompt("one"))
                .with_step(crate::agent::Step::prompt("two"))
                .with_step(crate::agent::Step::prompt("three")),
        );

        let ctx = CallContext::new("s1", DelegateContext::root("flow"));
        let err = factory
            .run_pda_with_events(ctx, "flow", "start", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 1 completed steps"));

        let transcript = sessions.transcript("s1");
        assert!(
            transcript
                .iter()
                .any(|m| m.content == "[PDA Agent flow interrupted at step 2/3]")
        );

        let metadata = sessions.metadata("s1").await.unwrap();
        assert!(metadata.get(crate::store::CHECKPOINT_KEY).is_some());
    }
}
