//! Delegation substrate: the envelope threaded through every call path and
//! the LLM-invokable `delegate` tool.

mod context;
mod tool;

pub use context::{DEFAULT_MAX_DELEGATION_DEPTH, DelegateContext, HARD_MAX_DELEGATION_DEPTH};
pub use tool::{DELEGATE_TOOL_NAME, DelegateTool};
