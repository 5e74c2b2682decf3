//! Convenience re-exports of the common surface.

pub use crate::agent::{AgentCatalog, AgentConfig, AgentLookup, Step};
pub use crate::delegate::{DELEGATE_TOOL_NAME, DelegateContext, DelegateTool};
pub use crate::error::{Error, Result, ToolError};
pub use crate::events::{AgentEvent, EventSink};
pub use crate::js::{JsRuntime, PoolConfig, RuntimePool, Sandbox, SandboxConfig, ToolLoader};
pub use crate::message::{Message, Role};
pub use crate::pda::{
    Engine, EngineHooks, Execution, PdaCheckpoint, PromptArgs, PromptFn, PromptMode,
    PromptOutcome,
};
pub use crate::provider::{ChatProvider, ChatRequest, ChatResponse, MockProvider, ProviderPool};
pub use crate::runner::{RunLimits, SubRunnerFactory, SubRunnerFactoryBuilder};
pub use crate::skill::{SkillManager, SkillManifest};
pub use crate::store::{
    CheckpointStore, KvStore, MemoryKvStore, MemorySessionStore, SessionStore,
};
pub use crate::tool::{
    CallContext, MANAGE_AGENTS_TOOL_NAME, ManageAgentsTool, SharedToolRegistry, Tool,
    ToolDefinition, ToolRegistry,
};
pub use crate::usage::Usage;
