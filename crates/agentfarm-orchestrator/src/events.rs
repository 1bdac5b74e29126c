//! Orchestration events and the sinks that observe them.
//!
//! Events are emitted while the orchestrator holds its state lock, so a sink
//! sees each task's events in lifecycle order. Sinks must not block.

use crate::batch::BatchStatus;
use crate::types::{AgentId, BatchId, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A lifecycle change inside the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// An agent was added or its configuration replaced.
    AgentRegistered {
        agent_id: AgentId,
    },
    /// An agent was removed; `released` were in flight on it.
    AgentUnregistered {
        agent_id: AgentId,
        released: Vec<TaskId>,
    },
    /// A task entered the queue for the first time.
    TaskQueued {
        task_id: TaskId,
    },
    /// A run began; `attempt` counts from 1.
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    /// A run failed and the task was re-queued.
    TaskRetrying {
        task_id: TaskId,
        attempts: u32,
        delay_ms: u64,
        error: String,
    },
    /// A run produced a result.
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        duration_ms: u64,
    },
    /// The task failed for good.
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        error: String,
    },
    /// The task was cancelled before producing a result.
    TaskCancelled {
        task_id: TaskId,
    },
    /// A batch member reached a terminal state.
    BatchProgress {
        batch_id: BatchId,
        completed: usize,
        failed: usize,
        total: usize,
    },
    /// Every member of a batch is terminal.
    BatchCompleted {
        batch_id: BatchId,
        status: BatchStatus,
    },
}

impl OrchestratorEvent {
    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskQueued { task_id }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskRetrying { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id } => Some(*task_id),
            _ => None,
        }
    }
}

/// Observer for orchestration events.
pub trait EventSink: Send + Sync {
    /// Receive one event. Called with the orchestrator's lock held.
    fn emit(&self, event: OrchestratorEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Forwards events into an unbounded channel. Never drops while the receiver
/// is alive.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: OrchestratorEvent) {
        // receiver gone: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

/// Mirrors events to the `tracing` log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::AgentRegistered { agent_id } => {
                info!(agent = %agent_id, "Agent registered");
            }
            OrchestratorEvent::AgentUnregistered { agent_id, released } => {
                info!(agent = %agent_id, released = released.len(), "Agent unregistered");
            }
            OrchestratorEvent::TaskQueued { task_id } => {
                info!(task_id = %task_id, "Task queued");
            }
            OrchestratorEvent::TaskStarted {
                task_id,
                agent_id,
                attempt,
            } => {
                info!(task_id = %task_id, agent = %agent_id, attempt, "Task started");
            }
            OrchestratorEvent::TaskRetrying {
                task_id,
                attempts,
                delay_ms,
                error,
            } => {
                warn!(
                    task_id = %task_id,
                    attempts,
                    delay = ?Duration::from_millis(delay_ms),
                    error = %error,
                    "Task failed, retrying"
                );
            }
            OrchestratorEvent::TaskCompleted {
                task_id,
                agent_id,
                duration_ms,
            } => {
                info!(task_id = %task_id, agent = %agent_id, duration_ms, "Task completed");
            }
            OrchestratorEvent::TaskFailed {
                task_id,
                attempts,
                error,
            } => {
                warn!(task_id = %task_id, attempts, error = %error, "Task failed");
            }
            OrchestratorEvent::TaskCancelled { task_id } => {
                info!(task_id = %task_id, "Task cancelled");
            }
            OrchestratorEvent::BatchProgress {
                batch_id,
                completed,
                failed,
                total,
            } => {
                info!(batch_id = %batch_id, completed, failed, total, "Batch progress");
            }
            OrchestratorEvent::BatchCompleted { batch_id, status } => {
                info!(batch_id = %batch_id, status = ?status, "Batch completed");
            }
        }
    }
}

/// Fans one event out to several sinks.
pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiSink {
    fn emit(&self, event: OrchestratorEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
