use crate::batch::Batch;
use crate::types::{Agent, AgentId, AgentStatus, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Orchestrator-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    /// Tasks that finished with a result or a terminal failure.
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    /// Failed runs that were re-queued.
    pub retries: u64,
    /// Running mean over processed tasks that produced a duration.
    pub average_task_duration_ms: f64,
    /// Highest number of simultaneously running tasks seen.
    pub concurrent_peak: usize,
    pub queue_depth: usize,
    pub running: usize,
    #[serde(skip)]
    timed: u64,
}

impl OrchestratorMetrics {
    pub(crate) fn record_terminal(&mut self, duration_ms: Option<u64>, success: bool) {
        self.tasks_processed += 1;
        if success {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        if let Some(ms) = duration_ms {
            self.timed += 1;
            self.average_task_duration_ms +=
                (ms as f64 - self.average_task_duration_ms) / self.timed as f64;
        }
    }

    /// Succeeded share of processed tasks, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.tasks_processed == 0 {
            return 0.0;
        }
        self.tasks_succeeded as f64 / self.tasks_processed as f64 * 100.0
    }
}

/// Per-member line of a [`BatchReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub agent: Option<AgentId>,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl MemberReport {
    pub fn from_task(task: &Task) -> Self {
        let agent = task
            .result
            .as_ref()
            .map(|r| r.agent_id.clone())
            .or_else(|| task.assigned_agent.clone())
            .or_else(|| task.pinned_agent.clone());
        let error = match &task.status {
            TaskStatus::Failed { reason } => Some(reason.clone()),
            TaskStatus::Cancelled => Some("cancelled".to_string()),
            _ => task.last_error.clone(),
        };
        Self {
            task_id: task.id,
            status: task.status.clone(),
            agent,
            attempts: task.attempts,
            result: task.result.as_ref().map(|r| r.output.clone()),
            error,
            duration_ms: task.duration_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Completed share of all members, in percent.
    pub success_rate: f64,
    /// Mean duration of completed members, in milliseconds.
    pub average_duration_ms: f64,
}

/// Detailed view of a batch and each of its members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch: Batch,
    pub members: Vec<MemberReport>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn new(batch: Batch, members: Vec<MemberReport>) -> Self {
        let durations: Vec<u64> = members.iter().filter_map(|m| m.duration_ms).collect();
        let average_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };
        let success_rate = if batch.total == 0 {
            0.0
        } else {
            batch.completed as f64 / batch.total as f64 * 100.0
        };
        let summary = BatchSummary {
            total: batch.total,
            completed: batch.completed,
            failed: batch.failed,
            in_progress: batch.in_progress,
            success_rate,
            average_duration_ms,
        };
        Self {
            batch,
            members,
            summary,
        }
    }
}

/// Agents counted by derived status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounts {
    pub idle: usize,
    pub working: usize,
    pub errored: usize,
    pub offline: usize,
}

/// One agent's line in a [`FarmStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub agent_id: AgentId,
    pub name: String,
    pub provider: String,
    pub status: AgentStatus,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub tokens_used: u64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
}

impl AgentUsage {
    /// Snapshot one agent's usage.
    pub fn from_agent(agent: &Agent) -> Self {
        Self {
            agent_id: agent.id.clone(),
            name: agent.name.clone(),
            provider: agent.provider.clone(),
            status: agent.status,
            in_flight: agent.current_load(),
            completed: agent.metrics.completed,
            failed: agent.metrics.failed,
            tokens_used: agent.metrics.tokens_used,
            total_cost: agent.metrics.total_cost,
            avg_latency_ms: agent.metrics.avg_latency_ms,
        }
    }
}

/// Usage summed over every agent of one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub agents: usize,
    pub completed: u64,
    pub failed: u64,
    pub tokens_used: u64,
    pub total_cost: f64,
}

/// Farm-wide view: agent states, pooled usage and queue pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmStatus {
    pub accepting_work: bool,
    pub total_agents: usize,
    /// Agents not taken offline by an operator.
    pub active_agents: usize,
    pub agents_by_status: AgentCounts,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Mean latency of successful calls across all agents, weighted by
    /// each agent's completed count.
    pub avg_latency_ms: f64,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    /// Keyed by provider name; agents without one are under `""`.
    pub by_provider: BTreeMap<String, ProviderUsage>,
    /// In registration order.
    pub agents: Vec<AgentUsage>,
}

impl FarmStatus {
    /// Build the summary from agents given in registration order.
    pub fn new(
        agents: &[&Agent],
        queued_tasks: usize,
        running_tasks: usize,
        accepting_work: bool,
    ) -> Self {
        let mut counts = AgentCounts::default();
        let mut by_provider: BTreeMap<String, ProviderUsage> = BTreeMap::new();
        let mut latency_weight = 0.0;
        let mut status = Self {
            accepting_work,
            total_agents: agents.len(),
            active_agents: 0,
            agents_by_status: AgentCounts::default(),
            total_completed: 0,
            total_failed: 0,
            total_tokens: 0,
            total_cost: 0.0,
            avg_latency_ms: 0.0,
            queued_tasks,
            running_tasks,
            by_provider: BTreeMap::new(),
            agents: Vec::with_capacity(agents.len()),
        };

        for agent in agents {
            match agent.status {
                AgentStatus::Idle => counts.idle += 1,
                AgentStatus::Working => counts.working += 1,
                AgentStatus::Errored => counts.errored += 1,
                AgentStatus::Offline => counts.offline += 1,
            }
            let m = &agent.metrics;
            status.total_completed += m.completed;
            status.total_failed += m.failed;
            status.total_tokens += m.tokens_used;
            status.total_cost += m.total_cost;
            latency_weight += m.avg_latency_ms * m.completed as f64;

            let provider = by_provider.entry(agent.provider.clone()).or_default();
            provider.agents += 1;
            provider.completed += m.completed;
            provider.failed += m.failed;
            provider.tokens_used += m.tokens_used;
            provider.total_cost += m.total_cost;

            status.agents.push(AgentUsage::from_agent(agent));
        }

        status.active_agents = agents.len() - counts.offline;
        if status.total_completed > 0 {
            status.avg_latency_ms = latency_weight / status.total_completed as f64;
        }
        status.agents_by_status = counts;
        status.by_provider = by_provider;
        status
    }
}
