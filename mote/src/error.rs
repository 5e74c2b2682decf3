//! Error types for the mote runtime.
//!
//! A single crate-wide [`Error`] carries the failure classes the runtime
//! distinguishes: configuration problems caught before execution, workflow
//! validation failures, checkpoint restore mismatches, resource exhaustion,
//! capability denials, execution failures, and cooperative interruption.
//! Causes are kept as sources so callers can pattern-match on the original
//! failure (e.g. a provider's rate-limit error) through the chain.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error source preserved through wrapping.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed step, invalid skill manifest, handler outside the skill
    /// directory. Fatal at validation time; never surfaced to the LLM.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// A workflow graph failed pre-execution validation.
    #[error("workflow validation failed for agent '{agent}': {message}")]
    Validation {
        /// The root agent whose graph was validated.
        agent: String,
        /// Joined error-level diagnostics.
        message: String,
    },

    /// A checkpoint could not be restored against the live agent catalog.
    /// Surfaced distinctly so callers may choose to clear and restart.
    #[error("checkpoint invalid: {message}")]
    CheckpointInvalid {
        /// What made the snapshot unusable.
        message: String,
    },

    /// A bounded resource ran out: VM pool, stack depth, recursion limit.
    #[error("{resource} exhausted: {message}")]
    ResourceExhausted {
        /// The resource that ran out (e.g. "stack depth", "runtime pool").
        resource: String,
        /// Limit details.
        message: String,
    },

    /// A capability check rejected the operation: path or HTTP host not
    /// allow-listed, forbidden delegation. Tool invocations surface this as
    /// an error-typed result instead of propagating it.
    #[error("capability denied: {message}")]
    CapabilityDenied {
        /// Why the capability was refused.
        message: String,
    },

    /// An LLM provider, tool, or JS runtime failure during execution. The
    /// original error is preserved as the source.
    #[error("execution error in '{context}': {message}")]
    Execution {
        /// Originating script, agent, or step context.
        context: String,
        /// Human-readable failure description.
        message: String,
        /// The original structured error, when available.
        #[source]
        source: Option<BoxError>,
    },

    /// Cooperative cancellation of the outer context.
    #[error("execution interrupted: {cause}")]
    Interrupted {
        /// The cancellation cause.
        cause: String,
    },
}

impl Error {
    /// Create a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new validation error.
    #[must_use]
    pub fn validation(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Create a new checkpoint restore error.
    #[must_use]
    pub fn checkpoint_invalid(message: impl Into<String>) -> Self {
        Self::CheckpointInvalid {
            message: message.into(),
        }
    }

    /// Create a new resource exhaustion error.
    #[must_use]
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a new capability denial.
    #[must_use]
    pub fn capability_denied(message: impl Into<String>) -> Self {
        Self::CapabilityDenied {
            message: message.into(),
        }
    }

    /// Create a new execution error without a structured source.
    #[must_use]
    pub fn execution(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            context: context.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a new execution error preserving the original cause.
    #[must_use]
    pub fn execution_with_source(
        context: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Execution {
            context: context.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new interruption error.
    #[must_use]
    pub fn interrupted(cause: impl Into<String>) -> Self {
        Self::Interrupted {
            cause: cause.into(),
        }
    }

    /// Whether this error is a checkpoint restore failure.
    #[must_use]
    pub const fn is_checkpoint_invalid(&self) -> bool {
        matches!(self, Self::CheckpointInvalid { .. })
    }

    /// Whether this error is a cooperative interruption.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Execution {
            context: "json".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Execution {
            context: "io".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Errors produced by tool invocations.
///
/// Tool failures are observed by the LLM as error-typed results rather than
/// aborting the run; this type is the structured form those results carry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The arguments did not match the tool's parameter schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool ran but failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// No tool with the requested name is registered.
    #[error("tool '{0}' not found")]
    NotFound(String),

    /// A capability check refused the operation.
    #[error("capability denied: {0}")]
    Denied(String),
}

impl From<ToolError> for Error {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Denied(message) => Self::CapabilityDenied { message },
            other => Self::Execution {
                context: "tool".to_string(),
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}
