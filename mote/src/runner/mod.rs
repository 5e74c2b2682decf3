//! Per-agent execution assembly.
//!
//! The [`SubRunnerFactory`] materializes a fully configured execution
//! environment for one agent (provider, narrowed tool registry, system
//! prompt, event fan-out) without depending on the containing application.

mod factory;
mod orchestrator;
mod tracker;

pub use factory::{DelegateRun, RunLimits, SubRunnerFactory, SubRunnerFactoryBuilder};
pub use orchestrator::Orchestrator;
pub use tracker::{MemoryTracker, RunTracker, TrackedRun};
