use crate::aggregator::{Aggregation, AggregationStrategy};
use crate::types::{BatchId, TaskId};
use agentfarm_core::{FarmError, FarmResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// How a batch was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// Independent task specs routed through the scheduler.
    Batch,
    /// One request cloned onto every agent.
    FanOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::CompletedWithErrors)
    }
}

/// A group of tasks tracked together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub kind: BatchKind,
    /// Member task ids, in submission order.
    pub task_ids: Vec<TaskId>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub status: BatchStatus,
    #[serde(default)]
    pub aggregation_strategy: Option<AggregationStrategy>,
    /// Set once a fan-out batch finishes.
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    settled: HashSet<TaskId>,
}

impl Batch {
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fraction of members that have settled, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed + self.failed) as f64 / self.total as f64
    }
}

/// Batch bookkeeping. Counters move exactly once per member.
pub struct BatchTracker {
    batches: HashMap<BatchId, Batch>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self {
            batches: HashMap::new(),
        }
    }

    pub fn create(
        &mut self,
        name: impl Into<String>,
        kind: BatchKind,
        task_ids: Vec<TaskId>,
        aggregation_strategy: Option<AggregationStrategy>,
    ) -> BatchId {
        let id = Uuid::new_v4();
        let total = task_ids.len();
        self.batches.insert(
            id,
            Batch {
                id,
                name: name.into(),
                kind,
                task_ids,
                total,
                completed: 0,
                failed: 0,
                in_progress: total,
                status: BatchStatus::Pending,
                aggregation_strategy,
                aggregation: None,
                created_at: Utc::now(),
                completed_at: None,
                settled: HashSet::new(),
            },
        );
        id
    }

    /// Move a pending batch to running.
    pub fn start(&mut self, id: BatchId) -> FarmResult<()> {
        let batch = self.get_mut(id)?;
        if batch.status == BatchStatus::Pending {
            batch.status = BatchStatus::Running;
        }
        Ok(())
    }

    /// Count a member's terminal transition.
    ///
    /// Returns the batch's new status if this call finished it. Repeated calls
    /// for the same member are ignored.
    pub fn record_terminal(
        &mut self,
        id: BatchId,
        task_id: TaskId,
        success: bool,
    ) -> FarmResult<Option<BatchStatus>> {
        let batch = self.get_mut(id)?;
        if batch.is_finished() || !batch.task_ids.contains(&task_id) {
            return Ok(None);
        }
        if !batch.settled.insert(task_id) {
            return Ok(None);
        }

        batch.in_progress -= 1;
        if success {
            batch.completed += 1;
        } else {
            batch.failed += 1;
        }
        debug_assert_eq!(batch.completed + batch.failed + batch.in_progress, batch.total);

        if batch.in_progress > 0 {
            return Ok(None);
        }
        batch.status = match batch.kind {
            BatchKind::FanOut => BatchStatus::Completed,
            BatchKind::Batch if batch.failed == 0 => BatchStatus::Completed,
            BatchKind::Batch => BatchStatus::CompletedWithErrors,
        };
        batch.completed_at = Some(Utc::now());
        Ok(Some(batch.status))
    }

    pub fn set_aggregation(&mut self, id: BatchId, aggregation: Aggregation) -> FarmResult<()> {
        self.get_mut(id)?.aggregation = Some(aggregation);
        Ok(())
    }

    pub fn get(&self, id: BatchId) -> Option<&Batch> {
        self.batches.get(&id)
    }

    fn get_mut(&mut self, id: BatchId) -> FarmResult<&mut Batch> {
        self.batches
            .get_mut(&id)
            .ok_or(FarmError::BatchNotFound(id))
    }

    /// Drop a batch record. Member tasks are left alone.
    pub fn remove(&mut self, id: BatchId) -> FarmResult<Batch> {
        self.batches
            .remove(&id)
            .ok_or(FarmError::BatchNotFound(id))
    }

    /// Drop every finished batch and return their ids.
    pub fn clear_finished(&mut self) -> Vec<BatchId> {
        let finished: Vec<BatchId> = self
            .batches
            .values()
            .filter(|b| b.is_finished())
            .map(|b| b.id)
            .collect();
        for id in &finished {
            self.batches.remove(id);
        }
        finished
    }

    /// All batches, oldest first.
    pub fn all(&self) -> Vec<&Batch> {
        let mut batches: Vec<&Batch> = self.batches.values().collect();
        batches.sort_by_key(|b| b.created_at);
        batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<TaskId> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_batch_lifecycle_all_success() {
        let mut tracker = BatchTracker::new();
        let members = ids(2);
        let id = tracker.create("nightly", BatchKind::Batch, members.clone(), None);
        assert_eq!(tracker.get(id).unwrap().status, BatchStatus::Pending);

        tracker.start(id).unwrap();
        assert_eq!(tracker.get(id).unwrap().status, BatchStatus::Running);

        assert_eq!(tracker.record_terminal(id, members[0], true).unwrap(), None);
        let batch = tracker.get(id).unwrap();
        assert_eq!((batch.completed, batch.failed, batch.in_progress), (1, 0, 1));
        assert!((batch.progress() - 0.5).abs() < f64::EPSILON);

        let done = tracker.record_terminal(id, members[1], true).unwrap();
        assert_eq!(done, Some(BatchStatus::Completed));
        assert!(tracker.get(id).unwrap().completed_at.is_some());
    }

    #[test]
    fn test_batch_with_failures() {
        let mut tracker = BatchTracker::new();
        let members = ids(2);
        let id = tracker.create("b", BatchKind::Batch, members.clone(), None);
        tracker.start(id).unwrap();
        tracker.record_terminal(id, members[0], false).unwrap();
        let done = tracker.record_terminal(id, members[1], true).unwrap();
        assert_eq!(done, Some(BatchStatus::CompletedWithErrors));
    }

    #[test]
    fn test_fan_out_always_completed() {
        let mut tracker = BatchTracker::new();
        let members = ids(2);
        let id = tracker.create(
            "fan",
            BatchKind::FanOut,
            members.clone(),
            Some(AggregationStrategy::Merge),
        );
        tracker.start(id).unwrap();
        tracker.record_terminal(id, members[0], false).unwrap();
        let done = tracker.record_terminal(id, members[1], false).unwrap();
        assert_eq!(done, Some(BatchStatus::Completed));
        assert_eq!(tracker.get(id).unwrap().failed, 2);
    }

    #[test]
    fn test_member_counted_once() {
        let mut tracker = BatchTracker::new();
        let members = ids(3);
        let id = tracker.create("b", BatchKind::Batch, members.clone(), None);
        tracker.record_terminal(id, members[0], true).unwrap();
        tracker.record_terminal(id, members[0], false).unwrap();
        // not a member
        tracker.record_terminal(id, Uuid::new_v4(), true).unwrap();

        let batch = tracker.get(id).unwrap();
        assert_eq!((batch.completed, batch.failed, batch.in_progress), (1, 0, 2));
    }

    #[test]
    fn test_unknown_batch() {
        let mut tracker = BatchTracker::new();
        let err = tracker.start(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, FarmError::BatchNotFound(_)));
    }

    #[test]
    fn test_clear_finished_keeps_running() {
        let mut tracker = BatchTracker::new();
        let done_members = ids(1);
        let done = tracker.create("done", BatchKind::Batch, done_members.clone(), None);
        let running = tracker.create("running", BatchKind::Batch, ids(1), None);
        tracker.record_terminal(done, done_members[0], true).unwrap();

        assert_eq!(tracker.clear_finished(), vec![done]);
        assert!(tracker.get(done).is_none());
        assert!(tracker.get(running).is_some());
        assert!(tracker.remove(running).is_ok());
        assert!(tracker.is_empty());
    }
}
