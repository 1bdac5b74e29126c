use agentfarm_core::{AgentBackend, BackendResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Why a run did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The call did not finish within the task's timeout.
    Timeout,
    /// The backend returned an error.
    Backend(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Backend(msg) => f.write_str(msg),
        }
    }
}

/// Outcome and wall-clock duration of a single run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// The backend response, or why there is none.
    pub outcome: Result<BackendResponse, FailureReason>,
    /// Measured on the tokio clock.
    pub duration: Duration,
}

impl ExecutionReport {
    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Whether the backend returned a response in time.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs one call against a backend under a timeout.
///
/// Never returns an error: every failure mode becomes a [`FailureReason`] so
/// the scheduling loop only ever sees state transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    /// Create an executor.
    pub fn new() -> Self {
        Self
    }

    /// Call `backend` once, giving up after `timeout`.
    pub async fn execute(
        &self,
        backend: Arc<dyn AgentBackend>,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> ExecutionReport {
        let start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, backend.call(payload)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(FailureReason::Backend(e.to_string())),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Backend call timed out");
                Err(FailureReason::Timeout)
            }
        };
        ExecutionReport {
            outcome,
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentfarm_core::{FarmError, FarmResult};
    use async_trait::async_trait;

    struct Sleepy(Duration);

    #[async_trait]
    impl AgentBackend for Sleepy {
        async fn call(&self, payload: &serde_json::Value) -> FarmResult<BackendResponse> {
            tokio::time::sleep(self.0).await;
            Ok(BackendResponse::new(payload.clone()).with_tokens(3))
        }
    }

    struct Broken;

    #[async_trait]
    impl AgentBackend for Broken {
        async fn call(&self, _payload: &serde_json::Value) -> FarmResult<BackendResponse> {
            Err(FarmError::Backend("HTTP 503".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_duration() {
        let executor = Executor::new();
        let report = executor
            .execute(
                Arc::new(Sleepy(Duration::from_millis(40))),
                &serde_json::json!("ping"),
                Duration::from_secs(1),
            )
            .await;
        assert!(report.is_success());
        assert_eq!(report.duration_ms(), 40);
        let response = report.outcome.unwrap();
        assert_eq!(response.output, serde_json::json!("ping"));
        assert_eq!(response.tokens_used, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_failure() {
        let report = Executor::new()
            .execute(
                Arc::new(Sleepy(Duration::from_secs(10))),
                &serde_json::Value::Null,
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(report.outcome.clone().unwrap_err(), FailureReason::Timeout);
        assert_eq!(report.duration_ms(), 100);
    }

    #[tokio::test]
    async fn test_backend_error_message_kept() {
        let report = Executor::new()
            .execute(Arc::new(Broken), &serde_json::Value::Null, Duration::from_secs(1))
            .await;
        let reason = report.outcome.unwrap_err();
        assert_eq!(reason.to_string(), "Backend error: HTTP 503");
    }

    #[test]
    fn test_timeout_reason_text() {
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
    }
}
