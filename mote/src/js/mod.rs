//! The sandboxed JS extension host.
//!
//! User-supplied tools run inside pooled QuickJS runtimes. Each execution
//! gets a per-run security envelope (the [`Sandbox`]) that injects the
//! capability-gated `mote` host API and interrupts the VM on timeout or
//! cancellation. A filesystem-watched [`ToolLoader`] hot-reloads tool
//! scripts with a per-path debounce.

mod loader;
mod pool;
mod runtime;
mod sandbox;

pub use loader::{JsScriptTool, ToolLoader};
pub use pool::{PoolConfig, RuntimePool};
pub use runtime::JsRuntime;
pub use sandbox::{INJECTED_GLOBALS, Sandbox, SandboxConfig, SandboxGuard};
