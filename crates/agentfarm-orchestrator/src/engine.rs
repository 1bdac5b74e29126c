use crate::aggregator::{self, AggregationStrategy, MemberOutcome};
use crate::batch::{Batch, BatchKind, BatchTracker};
use crate::config::OrchestratorConfig;
use crate::events::{EventSink, OrchestratorEvent, TracingSink};
use crate::executor::{ExecutionReport, Executor};
use crate::registry::{AgentRegistry, CallOutcome, Registration};
use crate::report::{BatchReport, FarmStatus, MemberReport, OrchestratorMetrics};
use crate::retry::{RetryController, RetryDecision};
use crate::strategy::{self, AgentSelector};
use crate::task_queue::TaskQueue;
use crate::types::{
    Agent, AgentConfig, AgentId, AgentStatus, BatchId, Task, TaskId, TaskResult, TaskSpec,
    TaskStatus,
};
use agentfarm_core::{AgentBackend, FarmError, FarmResult};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reason recorded on fan-out clones whose agent went away.
pub const AGENT_UNREGISTERED: &str = "agent unregistered";
/// Reason recorded on fan-out clones whose agent was taken offline.
pub const AGENT_OFFLINE: &str = "agent offline";

/// Run one payload on every registered, non-offline agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanOutRequest {
    /// Sent unchanged to every agent.
    pub payload: serde_json::Value,
    /// How member outputs are combined once all clones are terminal.
    #[serde(default)]
    pub aggregation: AggregationStrategy,
    /// Batch name; defaults to `fan-out (<aggregation>)`.
    #[serde(default)]
    pub name: Option<String>,
    /// Queue priority of every clone. Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Per-clone attempt limit; the orchestrator default when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-clone timeout; the orchestrator default when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl FanOutRequest {
    /// A request with `collect` aggregation and orchestrator defaults.
    pub fn new(payload: impl Into<serde_json::Value>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Set the aggregation strategy.
    pub fn with_aggregation(mut self, aggregation: AggregationStrategy) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Name the fan-out batch.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the attempt limit for every clone.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the per-call timeout for every clone.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

struct RunningTask {
    agent_id: AgentId,
    generation: u64,
    abort: AbortHandle,
}

/// Everything a spawned run needs, captured at assignment time.
struct Launch {
    task_id: TaskId,
    generation: u64,
    payload: serde_json::Value,
    timeout: Duration,
    backend: Arc<dyn AgentBackend>,
}

#[derive(Default)]
struct State {
    registry: AgentRegistry,
    tasks: HashMap<TaskId, Task>,
    queue: TaskQueue,
    batches: BatchTracker,
    running: HashMap<TaskId, RunningTask>,
    metrics: OrchestratorMetrics,
    shutting_down: bool,
}

impl State {
    fn is_current(&self, task_id: TaskId, generation: u64) -> bool {
        self.running
            .get(&task_id)
            .is_some_and(|run| run.generation == generation)
    }

    fn non_terminal_ids(&self) -> Vec<TaskId> {
        let mut open: Vec<&Task> = self.tasks.values().filter(|t| !t.is_terminal()).collect();
        open.sort_by_key(|t| t.created_at);
        open.into_iter().map(|t| t.id).collect()
    }

    /// Cancel a task that is not running. Running tasks are only flagged.
    fn cancel(&mut self, task_id: TaskId, sink: &dyn EventSink) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.is_terminal() {
            return false;
        }
        if self.running.contains_key(&task_id) {
            task.cancel_requested = true;
            return true;
        }
        self.queue.remove(task_id);
        self.finalize_cancel(task_id, sink);
        true
    }

    fn finalize_cancel(&mut self, task_id: TaskId, sink: &dyn EventSink) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        task.status = TaskStatus::Cancelled;
        task.assigned_agent = None;
        task.completed_at = Some(Utc::now());
        self.metrics.tasks_cancelled += 1;
        sink.emit(OrchestratorEvent::TaskCancelled { task_id });
        self.settle(task_id, false, sink);
    }

    /// Terminal failure that did not come from a run, e.g. a stranded clone.
    fn fail_without_run(&mut self, task_id: TaskId, reason: &str, sink: &dyn EventSink) {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        task.status = TaskStatus::Failed {
            reason: reason.to_string(),
        };
        task.last_error = Some(reason.to_string());
        task.assigned_agent = None;
        task.completed_at = Some(Utc::now());
        let attempts = task.attempts;
        self.metrics.record_terminal(None, false);
        sink.emit(OrchestratorEvent::TaskFailed {
            task_id,
            attempts,
            error: reason.to_string(),
        });
        self.settle(task_id, false, sink);
    }

    /// Record a batch and queue its members behind existing work.
    fn enqueue_batch(
        &mut self,
        name: &str,
        kind: BatchKind,
        tasks: Vec<Task>,
        aggregation: Option<AggregationStrategy>,
        sink: &dyn EventSink,
    ) -> FarmResult<BatchId> {
        let ids = tasks.iter().map(|t| t.id).collect();
        let batch_id = self.batches.create(name, kind, ids, aggregation);
        self.batches.start(batch_id)?;
        for task in tasks {
            let task = task.with_batch(batch_id);
            let task_id = task.id;
            self.queue.push_back(task_id, task.priority);
            self.tasks.insert(task_id, task);
            sink.emit(OrchestratorEvent::TaskQueued { task_id });
        }
        Ok(batch_id)
    }

    /// Fail queued fan-out clones bound to `agent_id`; they can never run.
    fn fail_pinned_queued(
        &mut self,
        agent_id: &str,
        reason: &str,
        sink: &dyn EventSink,
    ) -> usize {
        let stranded: Vec<TaskId> = self
            .queue
            .iter()
            .filter(|entry| {
                self.tasks
                    .get(&entry.task_id)
                    .and_then(|t| t.pinned_agent.as_deref())
                    == Some(agent_id)
            })
            .map(|entry| entry.task_id)
            .collect();
        for &task_id in &stranded {
            self.queue.remove(task_id);
            self.fail_without_run(task_id, reason, sink);
        }
        stranded.len()
    }

    /// Whether a task bound to one agent has lost that agent.
    fn pinned_agent_gone(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .and_then(|t| t.pinned_agent.as_deref())
            .is_some_and(|id| self.registry.get(id).map_or(true, |agent| agent.offline))
    }

    /// Count a terminal member against its batch and aggregate a finished
    /// fan-out.
    fn settle(&mut self, task_id: TaskId, success: bool, sink: &dyn EventSink) {
        let Some(batch_id) = self.tasks.get(&task_id).and_then(|t| t.batch_id) else {
            return;
        };
        // the batch record may have been removed by the caller
        let Ok(finished) = self.batches.record_terminal(batch_id, task_id, success) else {
            return;
        };
        let Some(batch) = self.batches.get(batch_id) else {
            return;
        };
        sink.emit(OrchestratorEvent::BatchProgress {
            batch_id,
            completed: batch.completed,
            failed: batch.failed,
            total: batch.total,
        });
        let Some(status) = finished else {
            return;
        };

        if batch.kind == BatchKind::FanOut {
            let strategy = batch.aggregation_strategy.unwrap_or_default();
            // clones were created in registration order
            let members: Vec<MemberOutcome> = batch
                .task_ids
                .iter()
                .enumerate()
                .filter_map(|(order, id)| {
                    self.tasks.get(id).map(|t| member_outcome(t, order as u64))
                })
                .collect();
            let aggregation = aggregator::aggregate(strategy, &members);
            if let Err(e) = self.batches.set_aggregation(batch_id, aggregation) {
                warn!(batch_id = %batch_id, error = %e, "Could not store aggregation");
            }
        }
        sink.emit(OrchestratorEvent::BatchCompleted { batch_id, status });
    }
}

fn member_outcome(task: &Task, registration_order: u64) -> MemberOutcome {
    let result = match (&task.status, &task.result) {
        (TaskStatus::Completed, Some(result)) => Ok((result.output.clone(), result.duration_ms)),
        (TaskStatus::Failed { reason }, _) => Err(reason.clone()),
        (other, _) => Err(other.label().to_string()),
    };
    MemberOutcome {
        task_id: task.id,
        agent_id: task.pinned_agent.clone().unwrap_or_default(),
        registration_order,
        result,
    }
}

struct Inner {
    config: OrchestratorConfig,
    selector: Box<dyn AgentSelector>,
    retry: RetryController,
    executor: Executor,
    sink: Arc<dyn EventSink>,
    state: Mutex<State>,
    changed: Notify,
}

/// The task orchestration engine.
///
/// A cheap `Clone` handle; clones share one engine. Scheduling is
/// edge-triggered: the queue is re-evaluated when a task is submitted or
/// finishes, when an agent is registered, updated, brought online or removed,
/// and when a retry backoff elapses. Submission methods spawn onto the
/// current tokio runtime and must be called from within one.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator that logs its events through `tracing`.
    pub fn new(config: OrchestratorConfig) -> FarmResult<Self> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Create an orchestrator that reports events to `sink`.
    pub fn with_sink(config: OrchestratorConfig, sink: Arc<dyn EventSink>) -> FarmResult<Self> {
        config.validate()?;
        info!(
            strategy = %config.strategy,
            max_concurrent = config.max_concurrent_tasks,
            max_attempts = config.retry.max_attempts,
            "Orchestrator created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                selector: config.strategy.selector(),
                retry: RetryController::new(config.retry),
                executor: Executor::new(),
                config,
                sink,
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        })
    }

    /// The validated configuration this orchestrator runs with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    // --- Agents ---

    /// Register an agent, or update one already registered under the same id.
    pub fn register_agent(
        &self,
        config: AgentConfig,
        backend: Arc<dyn AgentBackend>,
    ) -> FarmResult<Registration> {
        let agent_id = config.id.clone();
        let registration = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(FarmError::ShuttingDown);
            }
            let registration = state.registry.register(config, backend)?;
            self.inner.sink.emit(OrchestratorEvent::AgentRegistered {
                agent_id: agent_id.clone(),
            });
            registration
        };
        debug!(agent = %agent_id, registration = ?registration, "Agent registration applied");
        self.dispatch();
        Ok(registration)
    }

    /// Remove an agent. Its in-flight tasks are aborted and re-queued at the
    /// front of their priority band with their attempt count unchanged;
    /// fan-out clones bound to it fail instead.
    pub fn unregister_agent(&self, agent_id: &str) -> FarmResult<Vec<TaskId>> {
        let released = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let sink = self.inner.sink.as_ref();
            let released = state.registry.unregister(agent_id)?;

            let mut requeue = Vec::new();
            for &task_id in &released {
                if let Some(run) = state.running.remove(&task_id) {
                    run.abort.abort();
                }
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.cancel_requested {
                    state.finalize_cancel(task_id, sink);
                } else if task.pinned_agent.is_some() {
                    state.fail_without_run(task_id, AGENT_UNREGISTERED, sink);
                } else {
                    task.status = TaskStatus::Queued;
                    task.assigned_agent = None;
                    requeue.push((task_id, task.priority));
                }
            }
            // each push_front lands ahead of the last, so go in reverse to
            // keep the agent's original order
            for &(task_id, priority) in requeue.iter().rev() {
                state.queue.push_front(task_id, priority, None);
            }

            state.fail_pinned_queued(agent_id, AGENT_UNREGISTERED, sink);

            sink.emit(OrchestratorEvent::AgentUnregistered {
                agent_id: agent_id.to_string(),
                released: released.clone(),
            });
            released
        };

        if !released.is_empty() {
            warn!(agent = %agent_id, released = released.len(), "Agent removed with tasks in flight");
        }
        self.dispatch();
        self.inner.changed.notify_waiters();
        Ok(released)
    }

    /// Operator action: take an agent out of rotation, or bring it back.
    ///
    /// Taking an agent offline lets its running calls finish but fails any
    /// queued fan-out clone bound to it, so the fan-out can still complete.
    pub fn set_agent_offline(&self, agent_id: &str, offline: bool) -> FarmResult<()> {
        let stranded = {
            let mut state = self.inner.state.lock();
            state.registry.set_offline(agent_id, offline)?;
            if offline {
                state.fail_pinned_queued(agent_id, AGENT_OFFLINE, self.inner.sink.as_ref())
            } else {
                0
            }
        };
        info!(agent = %agent_id, offline, stranded, "Agent availability changed");
        if !offline {
            self.dispatch();
        }
        if stranded > 0 {
            self.inner.changed.notify_waiters();
        }
        Ok(())
    }

    // --- Submission ---

    /// Queue a single task.
    pub fn submit_task(&self, spec: TaskSpec) -> FarmResult<TaskId> {
        let task_id = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(FarmError::ShuttingDown);
            }
            let task = self.build_task(spec);
            let task_id = task.id;
            state.queue.push_back(task_id, task.priority);
            state.tasks.insert(task_id, task);
            self.inner.sink.emit(OrchestratorEvent::TaskQueued { task_id });
            task_id
        };
        self.dispatch();
        Ok(task_id)
    }

    /// Queue several independent tasks tracked under one batch.
    pub fn submit_batch(&self, name: &str, specs: Vec<TaskSpec>) -> FarmResult<BatchId> {
        if specs.is_empty() {
            return Err(FarmError::Config(format!("batch '{name}' has no tasks")));
        }
        let tasks: Vec<Task> = specs.into_iter().map(|s| self.build_task(s)).collect();
        let batch_id = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(FarmError::ShuttingDown);
            }
            let sink = self.inner.sink.as_ref();
            state.enqueue_batch(name, BatchKind::Batch, tasks, None, sink)?
        };
        self.dispatch();
        info!(batch_id = %batch_id, name = %name, "Batch submitted");
        Ok(batch_id)
    }

    /// Clone one request onto every registered, non-offline agent.
    ///
    /// Each clone is bound to its agent and skips capability filtering. Fails
    /// with a configuration error when no agent is available.
    pub fn fan_out(&self, request: FanOutRequest) -> FarmResult<BatchId> {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("fan-out ({})", request.aggregation));

        // membership is read and the clones queued under one lock, so an
        // agent removed concurrently is either excluded or swept
        let (batch_id, members) = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(FarmError::ShuttingDown);
            }
            let tasks: Vec<Task> = state
                .registry
                .all()
                .into_iter()
                .filter(|a| !a.offline)
                .map(|agent| {
                    let spec = TaskSpec {
                        payload: request.payload.clone(),
                        capability: None,
                        priority: request.priority,
                        max_attempts: request.max_attempts,
                        timeout_ms: request.timeout_ms,
                        preferred_agent: None,
                    };
                    self.build_task(spec).pinned_to(agent.id.clone())
                })
                .collect();
            if tasks.is_empty() {
                return Err(FarmError::Config(
                    "fan-out needs at least one available agent".into(),
                ));
            }
            let members = tasks.len();
            let batch_id = state.enqueue_batch(
                &name,
                BatchKind::FanOut,
                tasks,
                Some(request.aggregation),
                self.inner.sink.as_ref(),
            )?;
            (batch_id, members)
        };
        self.dispatch();
        info!(
            batch_id = %batch_id,
            agents = members,
            aggregation = %request.aggregation,
            "Fan-out submitted"
        );
        Ok(batch_id)
    }

    fn build_task(&self, spec: TaskSpec) -> Task {
        Task::from_spec(
            spec,
            self.inner.config.retry.max_attempts,
            self.inner.config.default_timeout_ms,
        )
    }

    // --- Cancellation and shutdown ---

    /// Cancel a task. Queued or retrying tasks are cancelled at once; a
    /// running task finishes its call and the result is discarded.
    ///
    /// Returns `false` if the task had already reached a terminal state.
    pub fn cancel_task(&self, task_id: TaskId) -> FarmResult<bool> {
        let cancelled = {
            let mut state = self.inner.state.lock();
            if !state.tasks.contains_key(&task_id) {
                return Err(FarmError::TaskNotFound(task_id));
            }
            state.cancel(task_id, self.inner.sink.as_ref())
        };
        self.inner.changed.notify_waiters();
        Ok(cancelled)
    }

    /// Cancel every non-terminal task. Returns how many were affected.
    pub fn cancel_all(&self) -> usize {
        let count = {
            let mut state = self.inner.state.lock();
            let sink = self.inner.sink.as_ref();
            state
                .non_terminal_ids()
                .into_iter()
                .filter(|id| state.cancel(*id, sink))
                .count()
        };
        info!(count, "Cancelled all open tasks");
        self.inner.changed.notify_waiters();
        count
    }

    /// Stop accepting work, abort and cancel every open task and take all
    /// agents offline.
    pub fn shutdown(&self) -> usize {
        let cancelled = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let sink = self.inner.sink.as_ref();
            state.shutting_down = true;

            let open = state.non_terminal_ids();
            for &task_id in &open {
                if let Some(run) = state.running.remove(&task_id) {
                    run.abort.abort();
                    state
                        .registry
                        .finish(&run.agent_id, task_id, CallOutcome::Discarded);
                }
                state.queue.remove(task_id);
                state.finalize_cancel(task_id, sink);
            }
            for agent_id in state.registry.ids() {
                // ids come from the registry itself
                let _ = state.registry.set_offline(&agent_id, true);
            }
            open.len()
        };
        info!(cancelled, "Orchestrator shut down");
        self.inner.changed.notify_waiters();
        cancelled
    }

    // --- Queries ---

    /// Snapshot of one task.
    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.state.lock().tasks.get(&task_id).cloned()
    }

    /// Snapshot of one batch.
    pub fn get_batch(&self, batch_id: BatchId) -> Option<Batch> {
        self.inner.state.lock().batches.get(batch_id).cloned()
    }

    /// Snapshot of one agent, including load and metrics.
    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.inner.state.lock().registry.get(agent_id).cloned()
    }

    /// Derived status of one agent.
    pub fn get_agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.inner
            .state
            .lock()
            .registry
            .get(agent_id)
            .map(|a| a.status)
    }

    /// All agents in registration order.
    pub fn list_agents(&self) -> Vec<Agent> {
        self.inner
            .state
            .lock()
            .registry
            .all()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Queued tasks in dispatch order.
    pub fn queue_snapshot(&self) -> Vec<Task> {
        let state = self.inner.state.lock();
        state
            .queue
            .iter()
            .filter_map(|entry| state.tasks.get(&entry.task_id).cloned())
            .collect()
    }

    /// Task counters plus current queue depth and running count.
    pub fn metrics(&self) -> OrchestratorMetrics {
        let state = self.inner.state.lock();
        let mut metrics = state.metrics.clone();
        metrics.queue_depth = state.queue.len();
        metrics.running = state.running.len();
        metrics
    }

    /// Farm-wide summary: agents by status and usage pooled across agents.
    pub fn status(&self) -> FarmStatus {
        let state = self.inner.state.lock();
        FarmStatus::new(
            &state.registry.all(),
            state.queue.len(),
            state.running.len(),
            !state.shutting_down,
        )
    }

    /// Per-member detail and summary for a batch.
    pub fn batch_report(&self, batch_id: BatchId) -> FarmResult<BatchReport> {
        let state = self.inner.state.lock();
        let batch = state
            .batches
            .get(batch_id)
            .ok_or(FarmError::BatchNotFound(batch_id))?;
        let members = batch
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(MemberReport::from_task)
            .collect();
        Ok(BatchReport::new(batch.clone(), members))
    }

    /// Forget a batch record. Member tasks stay queryable.
    pub fn remove_batch(&self, batch_id: BatchId) -> FarmResult<Batch> {
        self.inner.state.lock().batches.remove(batch_id)
    }

    /// Forget every finished batch and return their ids.
    pub fn clear_finished_batches(&self) -> Vec<BatchId> {
        self.inner.state.lock().batches.clear_finished()
    }

    // --- Waiting ---

    /// Resolve once the task reaches a terminal state.
    pub async fn wait_for_task(&self, task_id: TaskId) -> FarmResult<Task> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                let task = state
                    .tasks
                    .get(&task_id)
                    .ok_or(FarmError::TaskNotFound(task_id))?;
                if task.is_terminal() {
                    return Ok(task.clone());
                }
            }
            notified.await;
        }
    }

    /// Resolve once every member of the batch is terminal.
    pub async fn wait_for_batch(&self, batch_id: BatchId) -> FarmResult<Batch> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock();
                let batch = state
                    .batches
                    .get(batch_id)
                    .ok_or(FarmError::BatchNotFound(batch_id))?;
                if batch.is_finished() {
                    return Ok(batch.clone());
                }
            }
            notified.await;
        }
    }

    // --- Scheduling ---

    /// Assign queued tasks to agents until the global cap is reached or no
    /// queued task can be placed.
    fn dispatch(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return;
        }
        let now = Instant::now();
        while state.running.len() < self.inner.config.max_concurrent_tasks {
            let Some((task_id, agent_id)) = self.next_assignment(state, now) else {
                break;
            };
            if !self.launch(state, task_id, agent_id) {
                break;
            }
        }
    }

    /// First queued task, in dispatch order, that has a ready backoff and an
    /// eligible agent.
    fn next_assignment(&self, state: &State, now: Instant) -> Option<(TaskId, AgentId)> {
        for entry in state.queue.iter() {
            if !entry.is_ready(now) {
                continue;
            }
            let Some(task) = state.tasks.get(&entry.task_id) else {
                continue;
            };
            let candidates = state.registry.candidates_for(task);
            let chosen = strategy::choose(
                self.inner.selector.as_ref(),
                &candidates,
                task.preferred_agent.as_deref(),
            );
            if let Some(agent) = chosen {
                return Some((task.id, agent.id.clone()));
            }
        }
        None
    }

    fn launch(&self, state: &mut State, task_id: TaskId, agent_id: AgentId) -> bool {
        if !state.tasks.contains_key(&task_id) {
            state.queue.remove(task_id);
            return true;
        }
        let backend = match state.registry.acquire(&agent_id, task_id) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(task_id = %task_id, agent = %agent_id, error = %e, "Assignment rejected");
                return false;
            }
        };
        state.queue.remove(task_id);

        let Some(task) = state.tasks.get_mut(&task_id) else {
            return false;
        };
        task.generation += 1;
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent_id.clone());
        let launch = Launch {
            task_id,
            generation: task.generation,
            payload: task.payload.clone(),
            timeout: task.timeout(),
            backend,
        };
        let generation = launch.generation;

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(launch).await });
        state.running.insert(
            task_id,
            RunningTask {
                agent_id: agent_id.clone(),
                generation,
                abort: handle.abort_handle(),
            },
        );
        state.metrics.concurrent_peak = state.metrics.concurrent_peak.max(state.running.len());
        debug!(task_id = %task_id, agent = %agent_id, "Task assigned");
        true
    }

    async fn run(self, launch: Launch) {
        let Launch {
            task_id,
            generation,
            payload,
            timeout,
            backend,
        } = launch;

        let skip = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !state.is_current(task_id, generation) {
                return;
            }
            let agent_id = state
                .running
                .get(&task_id)
                .map(|run| run.agent_id.clone())
                .unwrap_or_default();
            match state.tasks.get_mut(&task_id) {
                Some(task) if !task.cancel_requested => {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    self.inner.sink.emit(OrchestratorEvent::TaskStarted {
                        task_id,
                        agent_id,
                        attempt: task.attempts + 1,
                    });
                    false
                }
                _ => true,
            }
        };

        let report = if skip {
            None
        } else {
            Some(self.inner.executor.execute(backend, &payload, timeout).await)
        };
        self.on_finished(task_id, generation, report);
    }

    fn on_finished(&self, task_id: TaskId, generation: u64, report: Option<ExecutionReport>) {
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !state.is_current(task_id, generation) {
                debug!(task_id = %task_id, "Ignoring stale completion");
                return;
            }
            let Some(run) = state.running.remove(&task_id) else {
                return;
            };
            let cancelled = state.tasks.get(&task_id).map_or(true, |t| t.cancel_requested);
            match report {
                Some(report) if !cancelled => self.record_report(state, task_id, &run.agent_id, report),
                _ => {
                    state
                        .registry
                        .finish(&run.agent_id, task_id, CallOutcome::Discarded);
                    state.finalize_cancel(task_id, self.inner.sink.as_ref());
                }
            }
        }
        self.dispatch();
        self.inner.changed.notify_waiters();
    }

    fn record_report(
        &self,
        state: &mut State,
        task_id: TaskId,
        agent_id: &str,
        report: ExecutionReport,
    ) {
        let sink = self.inner.sink.as_ref();
        let duration_ms = report.duration_ms();
        let pinned_gone = state.pinned_agent_gone(task_id);
        let Some(task) = state.tasks.get_mut(&task_id) else {
            state.registry.finish(agent_id, task_id, CallOutcome::Discarded);
            return;
        };

        match report.outcome {
            Ok(response) => {
                let (tokens_used, cost) = (response.tokens_used, response.cost);
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                task.result = Some(TaskResult {
                    agent_id: agent_id.to_string(),
                    output: response.output,
                    duration_ms,
                    tokens_used,
                    cost,
                });
                state.registry.finish(
                    agent_id,
                    task_id,
                    CallOutcome::Succeeded {
                        duration_ms,
                        tokens_used,
                        cost,
                    },
                );
                state.metrics.record_terminal(Some(duration_ms), true);
                sink.emit(OrchestratorEvent::TaskCompleted {
                    task_id,
                    agent_id: agent_id.to_string(),
                    duration_ms,
                });
                state.settle(task_id, true, sink);
            }
            Err(reason) => {
                let error = reason.to_string();
                match self.inner.retry.on_failure(task, &error) {
                    RetryDecision::Retry { .. } if pinned_gone => {
                        state
                            .registry
                            .finish(agent_id, task_id, CallOutcome::Failed { terminal: false });
                        state.fail_without_run(task_id, AGENT_OFFLINE, sink);
                    }
                    RetryDecision::Retry { delay } => {
                        let (attempts, priority) = (task.attempts, task.priority);
                        state
                            .registry
                            .finish(agent_id, task_id, CallOutcome::Failed { terminal: false });
                        let not_before = (!delay.is_zero()).then(|| Instant::now() + delay);
                        state.queue.push_front(task_id, priority, not_before);
                        state.metrics.retries += 1;
                        sink.emit(OrchestratorEvent::TaskRetrying {
                            task_id,
                            attempts,
                            delay_ms: delay.as_millis() as u64,
                            error,
                        });
                        if !delay.is_zero() {
                            self.wake_after(delay);
                        }
                    }
                    RetryDecision::GiveUp => {
                        let attempts = task.attempts;
                        state
                            .registry
                            .finish(agent_id, task_id, CallOutcome::Failed { terminal: true });
                        state.metrics.record_terminal(Some(duration_ms), false);
                        sink.emit(OrchestratorEvent::TaskFailed {
                            task_id,
                            attempts,
                            error,
                        });
                        state.settle(task_id, false, sink);
                    }
                }
            }
        }
    }

    /// Re-run dispatch once a retry backoff has elapsed.
    fn wake_after(&self, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.dispatch();
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::retry::RetryPolicy;
    use crate::strategy::Strategy;
    use agentfarm_core::BackendResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl AgentBackend for Echo {
        async fn call(&self, payload: &serde_json::Value) -> FarmResult<BackendResponse> {
            Ok(BackendResponse::new(payload.clone()))
        }
    }

    /// Fails the first `n` calls, then echoes.
    struct Flaky {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl AgentBackend for Flaky {
        async fn call(&self, payload: &serde_json::Value) -> FarmResult<BackendResponse> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FarmError::Backend("flaky".into()));
            }
            Ok(BackendResponse::new(payload.clone()))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_strategy(Strategy::LeastBusy)
            .with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = Orchestrator::new(OrchestratorConfig::default().with_max_concurrent_tasks(0))
            .err()
            .unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(AgentConfig::new("echo", "Echo"), Arc::new(Echo))
            .unwrap();

        let id = orch.submit_task(TaskSpec::new("hello")).unwrap();
        let task = orch.wait_for_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.unwrap();
        assert_eq!(result.output, serde_json::json!("hello"));
        assert_eq!(result.agent_id, "echo");

        let metrics = orch.metrics();
        assert_eq!(metrics.tasks_succeeded, 1);
        assert_eq!(metrics.running, 0);
        assert_eq!(orch.get_agent("echo").unwrap().metrics.completed, 1);
    }

    #[tokio::test]
    async fn test_task_waits_for_capable_agent() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(
            AgentConfig::new("chat", "Chat").with_capabilities(["chat"]),
            Arc::new(Echo),
        )
        .unwrap();

        let id = orch
            .submit_task(TaskSpec::new("diagram").with_capability("vision"))
            .unwrap();
        assert_eq!(orch.get_task(id).unwrap().status, TaskStatus::Queued);
        assert_eq!(orch.queue_snapshot().len(), 1);

        orch.register_agent(
            AgentConfig::new("eye", "Eye").with_capabilities(["vision"]),
            Arc::new(Echo),
        )
        .unwrap();
        let task = orch.wait_for_task(id).await.unwrap();
        assert_eq!(task.result.unwrap().agent_id, "eye");
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(
            AgentConfig::new("flaky", "Flaky"),
            Arc::new(Flaky {
                remaining: AtomicU32::new(2),
            }),
        )
        .unwrap();

        let id = orch.submit_task(TaskSpec::new("x")).unwrap();
        let task = orch.wait_for_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.last_error.as_deref(), Some("Backend error: flaky"));
        assert_eq!(orch.metrics().retries, 2);
        assert_eq!(orch.get_agent("flaky").unwrap().metrics.failed_calls, 2);
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle_order() {
        let (sink, mut rx) = ChannelSink::new();
        let orch = Orchestrator::with_sink(config(), Arc::new(sink)).unwrap();
        orch.register_agent(
            AgentConfig::new("flaky", "Flaky"),
            Arc::new(Flaky {
                remaining: AtomicU32::new(1),
            }),
        )
        .unwrap();
        let id = orch.submit_task(TaskSpec::new("x")).unwrap();
        orch.wait_for_task(id).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.task_id() == Some(id) {
                let value = serde_json::to_value(&event).unwrap();
                kinds.push(value["event"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(
            kinds,
            vec![
                "task_queued",
                "task_started",
                "task_retrying",
                "task_started",
                "task_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let orch = Orchestrator::new(config()).unwrap();
        let id = orch.submit_task(TaskSpec::new("nobody home")).unwrap();

        assert!(orch.cancel_task(id).unwrap());
        assert_eq!(orch.get_task(id).unwrap().status, TaskStatus::Cancelled);
        assert!(!orch.cancel_task(id).unwrap());
        assert!(orch.queue_snapshot().is_empty());
        assert_eq!(orch.metrics().tasks_cancelled, 1);

        let missing = orch.cancel_task(uuid::Uuid::new_v4()).unwrap_err();
        assert!(matches!(missing, FarmError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_fan_out_without_agents_is_config_error() {
        let orch = Orchestrator::new(config()).unwrap();
        let err = orch.fan_out(FanOutRequest::new("hi")).unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let orch = Orchestrator::new(config()).unwrap();
        assert!(orch.submit_batch("empty", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_work() {
        let orch = Orchestrator::new(config()).unwrap();
        orch.register_agent(AgentConfig::new("a", "A"), Arc::new(Echo))
            .unwrap();
        orch.set_agent_offline("a", true).unwrap();
        let queued = orch.submit_task(TaskSpec::new(1)).unwrap();

        assert_eq!(orch.shutdown(), 1);
        assert_eq!(orch.get_task(queued).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(orch.get_agent_status("a"), Some(AgentStatus::Offline));
        assert!(matches!(
            orch.submit_task(TaskSpec::new(2)),
            Err(FarmError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_queries_do_not_mutate() {
        let orch = Orchestrator::new(config()).unwrap();
        let id = orch.submit_task(TaskSpec::new("parked")).unwrap();
        let before = orch.get_task(id).unwrap();
        let _ = orch.queue_snapshot();
        let _ = orch.metrics();
        let _ = orch.list_agents();
        let after = orch.get_task(id).unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(before.attempts, after.attempts);
        assert_eq!(orch.metrics().queue_depth, 1);
    }
}
