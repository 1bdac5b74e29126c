//! The adapter seam between the orchestrator and concrete providers.
//!
//! The orchestrator never sees provider-specific request or response shapes.
//! A remote model API, an automation webhook, or an in-process test double all
//! plug in by implementing [`AgentBackend`].

use crate::FarmResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a backend returns for a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Opaque provider output.
    pub output: serde_json::Value,
    /// Tokens consumed, when the provider reports them.
    #[serde(default)]
    pub tokens_used: Option<u64>,
    /// Monetary cost of the call, when the provider reports it.
    #[serde(default)]
    pub cost: Option<f64>,
}

impl BackendResponse {
    /// A response carrying only output, no usage figures.
    pub fn new(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            tokens_used: None,
            cost: None,
        }
    }

    /// Attach a token count.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    /// Attach a cost figure.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// A provider-specific collaborator that performs the actual work for an agent.
///
/// Implementations must be cheap to share: the orchestrator holds them behind
/// `Arc` and may call them from several tokio tasks at once, up to the agent's
/// concurrency limit.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Perform one call with the given payload.
    async fn call(&self, payload: &serde_json::Value) -> FarmResult<BackendResponse>;
}
