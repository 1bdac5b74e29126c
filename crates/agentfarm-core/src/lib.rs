//! Core types and error definitions for the agentfarm workspace.
//!
//! This crate provides the foundational pieces shared by the orchestrator and
//! the binaries that host it: the unified error type and the adapter seam that
//! every agent backend implements.
//!
//! # Main types
//!
//! - [`FarmError`] — Unified error enum for all agentfarm subsystems.
//! - [`FarmResult`] — Convenience alias for `Result<T, FarmError>`.
//! - [`AgentBackend`] — The single operation a provider adapter must expose.
//! - [`BackendResponse`] — Output plus optional usage reported by a backend.

/// Agent backend adapter trait and response type.
pub mod backend;

pub use backend::{AgentBackend, BackendResponse};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for agentfarm.
///
/// Configuration-time problems (`Config`, `AgentNotFound`, ...) are returned
/// synchronously to callers. Backend failures (`Backend`, `Http`) are produced
/// by adapters and absorbed by the orchestrator's retry path.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    /// Invalid configuration: unknown strategy, bad concurrency value, etc.
    #[error("Config error: {0}")]
    Config(String),

    /// No agent is registered under the given id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No task is tracked under the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No batch is tracked under the given id.
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    /// An agent was asked to take more work than its concurrency limit allows.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// The agent's backend call failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// An outbound HTTP request made by a backend adapter failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The orchestrator no longer accepts work.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`FarmError`].
pub type FarmResult<T> = Result<T, FarmError>;

impl FarmError {
    /// Whether this error is raised at configuration/submission time rather
    /// than during execution.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            FarmError::Config(_)
                | FarmError::AgentNotFound(_)
                | FarmError::TaskNotFound(_)
                | FarmError::BatchNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FarmError::Config("unknown strategy 'fastest'".into());
        assert_eq!(err.to_string(), "Config error: unknown strategy 'fastest'");
        assert!(err.is_config_error());
    }

    #[test]
    fn test_backend_error_is_not_config() {
        assert!(!FarmError::Backend("503".into()).is_config_error());
        assert!(!FarmError::ShuttingDown.is_config_error());
    }
}
