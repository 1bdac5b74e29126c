use agentfarm_core::{FarmError, FarmResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Stable, caller-chosen agent identifier.
pub type AgentId = String;
/// Unique task identifier.
pub type TaskId = Uuid;
/// Unique batch identifier.
pub type BatchId = Uuid;

/// Consecutive failed calls after which an otherwise idle agent reports
/// [`AgentStatus::Errored`].
pub const ERRORED_AFTER_FAILURES: u32 = 3;

fn default_concurrency_limit() -> usize {
    5
}

fn default_platform_priority() -> i32 {
    5
}

/// Registration-time description of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    /// Provider or platform type, e.g. `anthropic`, `n8n`.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Platform priority. Lower values are preferred by the `priority` strategy.
    #[serde(default = "default_platform_priority")]
    pub priority: i32,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: String::new(),
            capabilities: BTreeSet::new(),
            concurrency_limit: default_concurrency_limit(),
            priority: default_platform_priority(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Reject configurations the scheduler cannot honour.
    pub fn validate(&self) -> FarmResult<()> {
        if self.id.trim().is_empty() {
            return Err(FarmError::Config("agent id must not be empty".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(FarmError::Config(format!(
                "agent '{}' has concurrency_limit 0; it must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

/// Live status of an agent, derived from its load and recent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Offline,
    Errored,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Working => write!(f, "working"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Running counters kept per agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks this agent completed successfully.
    pub completed: u64,
    /// Tasks whose final, attempt-exhausting failure happened on this agent.
    pub failed: u64,
    /// Every failed call, including timeouts and calls later retried.
    pub failed_calls: u64,
    pub consecutive_failures: u32,
    /// Mean latency of successful calls, in milliseconds.
    pub avg_latency_ms: f64,
    pub tokens_used: u64,
    pub total_cost: f64,
}

impl AgentMetrics {
    pub(crate) fn record_success(&mut self, duration_ms: u64, tokens: Option<u64>, cost: Option<f64>) {
        self.completed += 1;
        self.consecutive_failures = 0;
        let n = self.completed as f64;
        self.avg_latency_ms += (duration_ms as f64 - self.avg_latency_ms) / n;
        self.tokens_used += tokens.unwrap_or(0);
        self.total_cost += cost.unwrap_or(0.0);
    }

    pub(crate) fn record_failed_call(&mut self) {
        self.failed_calls += 1;
        self.consecutive_failures += 1;
    }
}

/// Registry record for one agent, as exposed through the query API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub provider: String,
    pub capabilities: BTreeSet<String>,
    pub concurrency_limit: usize,
    pub priority: i32,
    /// Ids of the tasks currently running on this agent.
    pub in_flight: Vec<TaskId>,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
    /// Position in registration order; the tie-breaker for every strategy.
    pub registration_order: u64,
    pub registered_at: DateTime<Utc>,
    /// Set by operator action only.
    pub offline: bool,
    /// A configuration replacement is waiting for the agent to become idle.
    pub update_pending: bool,
}

impl Agent {
    pub fn from_config(config: AgentConfig, registration_order: u64) -> Self {
        Self {
            id: config.id,
            name: config.name,
            provider: config.provider,
            capabilities: config.capabilities,
            concurrency_limit: config.concurrency_limit,
            priority: config.priority,
            in_flight: Vec::new(),
            status: AgentStatus::Idle,
            metrics: AgentMetrics::default(),
            registration_order,
            registered_at: Utc::now(),
            offline: false,
            update_pending: false,
        }
    }

    /// Replace the configuration-derived fields, keeping load, metrics and
    /// registration order.
    pub(crate) fn apply_config(&mut self, config: AgentConfig) {
        self.name = config.name;
        self.provider = config.provider;
        self.capabilities = config.capabilities;
        self.concurrency_limit = config.concurrency_limit;
        self.priority = config.priority;
        self.refresh_status();
    }

    pub fn current_load(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.in_flight.len() < self.concurrency_limit
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Completed plus in-flight tasks, the measure used by `least-busy`.
    pub fn busyness(&self) -> u64 {
        self.metrics.completed + self.in_flight.len() as u64
    }

    /// Not offline, has spare capacity and, when required, the capability.
    pub fn is_eligible(&self, capability: Option<&str>) -> bool {
        !self.offline
            && self.has_spare_capacity()
            && capability.map_or(true, |cap| self.has_capability(cap))
    }

    pub(crate) fn refresh_status(&mut self) {
        self.status = if self.offline {
            AgentStatus::Offline
        } else if !self.in_flight.is_empty() {
            AgentStatus::Working
        } else if self.metrics.consecutive_failures >= ERRORED_AFTER_FAILURES {
            AgentStatus::Errored
        } else {
            AgentStatus::Idle
        };
    }
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    /// Failed at least once and waiting to run again.
    Retrying,
    Completed,
    Failed {
        reason: String,
    },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Short label, independent of any failure reason.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// What a caller submits. Unset fields fall back to orchestrator defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub capability: Option<String>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub preferred_agent: Option<AgentId>,
}

impl TaskSpec {
    pub fn new(payload: impl Into<serde_json::Value>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn prefer_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent_id.into());
        self
    }
}

/// Successful outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub agent_id: AgentId,
    pub output: serde_json::Value,
    pub duration_ms: u64,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// A task tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Back-reference to the owning batch, if any.
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub preferred_agent: Option<AgentId>,
    /// Hard binding used by fan-out clones; only this agent may run the task.
    #[serde(default)]
    pub pinned_agent: Option<AgentId>,
    pub priority: i32,
    /// Number of failed runs so far. Never decreases.
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Most recent failure message, kept across retries.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub(crate) cancel_requested: bool,
    /// Bumped on every dispatch so late completions of an abandoned run can be
    /// recognised and dropped.
    #[serde(skip)]
    pub(crate) generation: u64,
}

impl Task {
    pub fn new(payload: impl Into<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: None,
            payload: payload.into(),
            capability: None,
            preferred_agent: None,
            pinned_agent: None,
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            timeout_ms: 300_000,
            status: TaskStatus::Queued,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            cancel_requested: false,
            generation: 0,
        }
    }

    /// Build a task from a submission, filling unset fields from defaults.
    pub fn from_spec(spec: TaskSpec, default_max_attempts: u32, default_timeout_ms: u64) -> Self {
        let mut task = Self::new(spec.payload);
        task.capability = spec.capability;
        task.preferred_agent = spec.preferred_agent;
        task.priority = spec.priority;
        task.max_attempts = spec.max_attempts.unwrap_or(default_max_attempts).max(1);
        task.timeout_ms = spec.timeout_ms.unwrap_or(default_timeout_ms);
        task
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn pinned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.pinned_agent = Some(agent_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wall-clock runtime of the last run, if the task has finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.result.as_ref().map(|r| r.duration_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new(serde_json::json!({"prompt": "hi"}));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0);
        assert!(task.batch_id.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_task_from_spec_defaults() {
        let spec = TaskSpec::new("payload").with_priority(7).with_capability("code");
        let task = Task::from_spec(spec, 4, 1_000);
        assert_eq!(task.priority, 7);
        assert_eq!(task.max_attempts, 4);
        assert_eq!(task.timeout(), Duration::from_secs(1));
        assert_eq!(task.capability.as_deref(), Some("code"));
    }

    #[test]
    fn test_task_from_spec_overrides() {
        let spec = TaskSpec::new("payload")
            .with_max_attempts(2)
            .with_timeout(Duration::from_millis(250))
            .prefer_agent("claude");
        let task = Task::from_spec(spec, 3, 60_000);
        assert_eq!(task.max_attempts, 2);
        assert_eq!(task.timeout_ms, 250);
        assert_eq!(task.preferred_agent.as_deref(), Some("claude"));
    }

    #[test]
    fn test_zero_max_attempts_clamped() {
        let task = Task::from_spec(TaskSpec::new(1).with_max_attempts(0), 3, 1);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed { reason: "x".into() }.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_task_status_serialization() {
        let status = TaskStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("timeout"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
        assert_eq!(status.to_string(), "failed (timeout)");
    }

    #[test]
    fn test_agent_config_validation() {
        assert!(AgentConfig::new("a", "A").validate().is_ok());
        assert!(AgentConfig::new(" ", "blank").validate().is_err());
        assert!(AgentConfig::new("a", "A")
            .with_concurrency_limit(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_agent_config_deserialize_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"id": "groq", "name": "Groq"}"#).unwrap();
        assert_eq!(config.concurrency_limit, 5);
        assert_eq!(config.priority, 5);
        assert!(config.capabilities.is_empty());
    }

    #[test]
    fn test_agent_eligibility() {
        let config = AgentConfig::new("a", "A")
            .with_capabilities(["chat", "code"])
            .with_concurrency_limit(1);
        let mut agent = Agent::from_config(config, 1);
        assert!(agent.is_eligible(None));
        assert!(agent.is_eligible(Some("code")));
        assert!(!agent.is_eligible(Some("vision")));

        agent.in_flight.push(Uuid::new_v4());
        assert!(!agent.is_eligible(None));

        agent.in_flight.clear();
        agent.offline = true;
        assert!(!agent.is_eligible(None));
    }

    #[test]
    fn test_agent_status_derivation() {
        let mut agent = Agent::from_config(AgentConfig::new("a", "A"), 1);
        agent.refresh_status();
        assert_eq!(agent.status, AgentStatus::Idle);

        agent.in_flight.push(Uuid::new_v4());
        agent.refresh_status();
        assert_eq!(agent.status, AgentStatus::Working);

        agent.in_flight.clear();
        for _ in 0..ERRORED_AFTER_FAILURES {
            agent.metrics.record_failed_call();
        }
        agent.refresh_status();
        assert_eq!(agent.status, AgentStatus::Errored);

        agent.metrics.record_success(10, None, None);
        agent.refresh_status();
        assert_eq!(agent.status, AgentStatus::Idle);

        agent.offline = true;
        agent.refresh_status();
        assert_eq!(agent.status, AgentStatus::Offline);
    }

    #[test]
    fn test_metrics_running_mean() {
        let mut metrics = AgentMetrics::default();
        metrics.record_success(100, Some(10), Some(0.5));
        metrics.record_success(300, None, Some(0.25));
        assert_eq!(metrics.completed, 2);
        assert!((metrics.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(metrics.tokens_used, 10);
        assert!((metrics.total_cost - 0.75).abs() < f64::EPSILON);
    }
}
