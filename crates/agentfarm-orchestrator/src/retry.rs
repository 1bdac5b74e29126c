use crate::types::{Task, TaskStatus};
use agentfarm_core::{FarmError, FarmResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5_000
}

/// Configures how failed runs are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total runs a task may make, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds; the wait before a retry is `base × attempts`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    /// A policy with no delay between runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0)
    }

    /// Delay before the next run of a task that has failed `attempts` times.
    pub fn backoff(&self, attempts: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempts)))
    }

    pub fn validate(&self) -> FarmResult<()> {
        if self.max_attempts == 0 {
            return Err(FarmError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// What to do with a task after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue once `delay` has elapsed.
    Retry { delay: Duration },
    /// Attempts exhausted; the task is now terminally failed.
    GiveUp,
}

/// Applies a [`RetryPolicy`] to tasks after a failed run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record one failed run on `task` and move it to `Retrying` or `Failed`.
    ///
    /// The per-task `max_attempts` takes precedence over the policy, since it
    /// was resolved from the policy at submission time unless overridden.
    pub fn on_failure(&self, task: &mut Task, error: &str) -> RetryDecision {
        task.attempts += 1;
        task.last_error = Some(error.to_string());
        task.assigned_agent = None;

        if task.attempts < task.max_attempts {
            task.status = TaskStatus::Retrying;
            RetryDecision::Retry {
                delay: self.policy.backoff(task.attempts),
            }
        } else {
            task.status = TaskStatus::Failed {
                reason: error.to_string(),
            };
            task.completed_at = Some(chrono::Utc::now());
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 5_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(5, 100);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(RetryPolicy::immediate(2).backoff(4), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RetryPolicy::new(0, 10).validate().is_err());
    }

    #[test]
    fn test_policy_deserialize_partial() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.base_delay_ms, 5_000);
    }

    #[test]
    fn test_retry_then_give_up() {
        let controller = RetryController::new(RetryPolicy::new(2, 50));
        let mut task = Task::new("work");
        task.max_attempts = 2;

        let first = controller.on_failure(&mut task, "boom");
        assert_eq!(
            first,
            RetryDecision::Retry {
                delay: Duration::from_millis(50)
            }
        );
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.attempts, 1);

        let second = controller.on_failure(&mut task, "boom again");
        assert_eq!(second, RetryDecision::GiveUp);
        assert_eq!(task.attempts, 2);
        assert_eq!(
            task.status,
            TaskStatus::Failed {
                reason: "boom again".into()
            }
        );
        assert_eq!(task.last_error.as_deref(), Some("boom again"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_single_attempt_fails_immediately() {
        let controller = RetryController::default();
        let mut task = Task::new("work");
        task.max_attempts = 1;
        assert_eq!(controller.on_failure(&mut task, "timeout"), RetryDecision::GiveUp);
        assert_eq!(task.attempts, 1);
    }
}
