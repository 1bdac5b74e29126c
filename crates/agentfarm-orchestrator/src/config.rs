use crate::retry::RetryPolicy;
use crate::strategy::Strategy;
use agentfarm_core::{FarmError, FarmResult};
use serde::{Deserialize, Serialize};

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Orchestrator-wide settings, validated at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Agent selection strategy.
    #[serde(default)]
    pub strategy: Strategy,
    /// Global cap on running tasks, independent of per-agent limits.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Attempt limit and backoff for failed runs.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Timeout applied to tasks that do not set their own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            retry: RetryPolicy::default(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Set the agent selection strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the global cap on running tasks.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeout for tasks that do not carry their own.
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Named concurrency/timeout presets.
    ///
    /// | name | concurrent | timeout |
    /// |---|---|---|
    /// | `default` | 5 | 300 s |
    /// | `aggressive` | 10 | 180 s |
    /// | `conservative` | 2 | 600 s |
    /// | `single` | 1 | 600 s |
    pub fn preset(name: &str) -> FarmResult<Self> {
        let (max_concurrent_tasks, default_timeout_ms) = match name {
            "default" => (5, 300_000),
            "aggressive" => (10, 180_000),
            "conservative" => (2, 600_000),
            "single" => (1, 600_000),
            other => {
                return Err(FarmError::Config(format!("unknown preset '{other}'")));
            }
        };
        Ok(Self {
            max_concurrent_tasks,
            default_timeout_ms,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> FarmResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(FarmError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(FarmError::Config(
                "default_timeout_ms must be greater than 0".into(),
            ));
        }
        self.retry.validate()
    }
}
