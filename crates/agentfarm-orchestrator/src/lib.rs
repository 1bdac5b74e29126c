//! Task orchestration engine for a pool of heterogeneous agents.
//!
//! Callers submit single tasks, batches of independent tasks, or fan-out
//! requests that run one payload on every agent. The engine places queued
//! work on eligible agents with a configurable strategy, enforces per-agent
//! and global concurrency limits, retries failed runs with linear backoff,
//! tracks batch progress and aggregates fan-out results.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Shared handle to the engine: submission, queries, cancellation.
//! - [`AgentRegistry`] — Known agents, their backends and live load.
//! - [`TaskQueue`] — Priority queue with FIFO order inside each priority band.
//! - [`Strategy`] — `round-robin`, `least-busy` or `priority` agent selection.
//! - [`RetryPolicy`] — Attempt limit and backoff base for failed runs.
//! - [`AggregationStrategy`] — `merge`, `vote`, `best` or `collect` for fan-out results.
//! - [`EventSink`] — Observer for lifecycle events.
//! - [`FarmStatus`] — Agents by status and usage pooled across the farm.

/// Fan-out result aggregation.
pub mod aggregator;
/// Batch and fan-out progress tracking.
pub mod batch;
/// Orchestrator configuration and presets.
pub mod config;
/// The orchestrator facade and scheduling loop.
pub mod engine;
/// Lifecycle events and sinks.
pub mod events;
/// Timed execution of a single backend call.
pub mod executor;
/// Agent registry.
pub mod registry;
/// Metrics and batch reports.
pub mod report;
/// Retry policy and controller.
pub mod retry;
/// Agent selection strategies.
pub mod strategy;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Task, Agent, TaskSpec, etc.).
pub mod types;

pub use aggregator::{aggregate, AggregatedResult, Aggregation, AggregationStrategy};
pub use batch::{Batch, BatchKind, BatchStatus, BatchTracker};
pub use config::OrchestratorConfig;
pub use engine::{FanOutRequest, Orchestrator, AGENT_OFFLINE, AGENT_UNREGISTERED};
pub use events::{ChannelSink, EventSink, MultiSink, NullSink, OrchestratorEvent, TracingSink};
pub use executor::{ExecutionReport, Executor, FailureReason};
pub use registry::{AgentRegistry, Registration};
pub use report::{
    AgentCounts, AgentUsage, BatchReport, BatchSummary, FarmStatus, MemberReport,
    OrchestratorMetrics, ProviderUsage,
};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use strategy::{AgentSelector, Strategy};
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentConfig, AgentId, AgentMetrics, AgentStatus, BatchId, Task, TaskId, TaskResult,
    TaskSpec, TaskStatus,
};
