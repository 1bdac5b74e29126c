use crate::types::{Agent, AgentConfig, AgentId, Task, TaskId};
use agentfarm_core::{AgentBackend, FarmError, FarmResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of [`AgentRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new agent was added.
    Registered,
    /// An idle agent's configuration and backend were replaced.
    Replaced,
    /// The agent is busy; the update applies once its load reaches zero.
    Deferred,
}

/// How a call on an agent ended, for the agent's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallOutcome {
    Succeeded {
        duration_ms: u64,
        tokens_used: Option<u64>,
        cost: Option<f64>,
    },
    /// The call failed. `terminal` is set when the task ran out of attempts.
    Failed { terminal: bool },
    /// The result was thrown away (cancellation); no counters change.
    Discarded,
}

struct AgentEntry {
    agent: Agent,
    backend: Arc<dyn AgentBackend>,
    pending: Option<(AgentConfig, Arc<dyn AgentBackend>)>,
}

/// Known agents, their backends and live load.
///
/// Not synchronised on its own; the orchestrator keeps it inside its state
/// lock.
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentEntry>,
    next_order: u64,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            next_order: 1,
        }
    }

    /// Add an agent, or update an existing one under the same id.
    pub fn register(
        &mut self,
        config: AgentConfig,
        backend: Arc<dyn AgentBackend>,
    ) -> FarmResult<Registration> {
        config.validate()?;

        if let Some(entry) = self.agents.get_mut(&config.id) {
            if entry.agent.in_flight.is_empty() {
                entry.agent.apply_config(config);
                entry.agent.update_pending = false;
                entry.backend = backend;
                entry.pending = None;
                return Ok(Registration::Replaced);
            }
            entry.pending = Some((config, backend));
            entry.agent.update_pending = true;
            return Ok(Registration::Deferred);
        }

        let order = self.next_order;
        self.next_order += 1;
        let id = config.id.clone();
        self.agents.insert(
            id,
            AgentEntry {
                agent: Agent::from_config(config, order),
                backend,
                pending: None,
            },
        );
        Ok(Registration::Registered)
    }

    /// Remove an agent and return the ids of its in-flight tasks.
    pub fn unregister(&mut self, id: &str) -> FarmResult<Vec<TaskId>> {
        self.agents
            .remove(id)
            .map(|entry| entry.agent.in_flight)
            .ok_or_else(|| FarmError::AgentNotFound(id.to_string()))
    }

    /// Look up one agent.
    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id).map(|e| &e.agent)
    }

    /// Whether an agent is registered under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All agents in registration order.
    pub fn all(&self) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().map(|e| &e.agent).collect();
        agents.sort_by_key(|a| a.registration_order);
        agents
    }

    /// Agents able to take a task needing `capability` right now, in
    /// registration order.
    pub fn list_eligible(&self, capability: Option<&str>) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self
            .agents
            .values()
            .map(|e| &e.agent)
            .filter(|a| a.is_eligible(capability))
            .collect();
        agents.sort_by_key(|a| a.registration_order);
        agents
    }

    /// Candidates for a specific task. A pinned task only ever gets its own
    /// agent, regardless of capability.
    pub fn candidates_for(&self, task: &Task) -> Vec<&Agent> {
        match &task.pinned_agent {
            Some(pinned) => self
                .get(pinned)
                .filter(|a| a.is_eligible(None))
                .into_iter()
                .collect(),
            None => self.list_eligible(task.capability.as_deref()),
        }
    }

    /// Reserve a slot on `id` for `task_id` and hand back its backend.
    pub fn acquire(&mut self, id: &str, task_id: TaskId) -> FarmResult<Arc<dyn AgentBackend>> {
        let entry = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FarmError::AgentNotFound(id.to_string()))?;
        if !entry.agent.has_spare_capacity() {
            return Err(FarmError::Capacity(format!(
                "agent '{id}' is at its limit of {}",
                entry.agent.concurrency_limit
            )));
        }
        entry.agent.in_flight.push(task_id);
        entry.agent.refresh_status();
        Ok(Arc::clone(&entry.backend))
    }

    /// Release the slot held by `task_id` and record the call outcome.
    ///
    /// Returns `true` when a deferred update was applied as a result.
    pub fn finish(&mut self, id: &str, task_id: TaskId, outcome: CallOutcome) -> bool {
        let Some(entry) = self.agents.get_mut(id) else {
            return false;
        };
        entry.agent.in_flight.retain(|t| *t != task_id);

        match outcome {
            CallOutcome::Succeeded {
                duration_ms,
                tokens_used,
                cost,
            } => entry.agent.metrics.record_success(duration_ms, tokens_used, cost),
            CallOutcome::Failed { terminal } => {
                entry.agent.metrics.record_failed_call();
                if terminal {
                    entry.agent.metrics.failed += 1;
                }
            }
            CallOutcome::Discarded => {}
        }

        let mut applied = false;
        if entry.agent.in_flight.is_empty() {
            if let Some((config, backend)) = entry.pending.take() {
                entry.agent.apply_config(config);
                entry.agent.update_pending = false;
                entry.backend = backend;
                applied = true;
            }
        }
        entry.agent.refresh_status();
        applied
    }

    /// Operator action: take an agent out of (or back into) rotation.
    pub fn set_offline(&mut self, id: &str, offline: bool) -> FarmResult<()> {
        let entry = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FarmError::AgentNotFound(id.to_string()))?;
        entry.agent.offline = offline;
        entry.agent.refresh_status();
        Ok(())
    }

    /// Agent ids in registration order.
    pub fn ids(&self) -> Vec<AgentId> {
        self.all().into_iter().map(|a| a.id.clone()).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
