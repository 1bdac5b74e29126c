use crate::types::TaskId;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

type QueueKey = (Reverse<i32>, i64);

/// A queued task reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: i32,
    /// Earliest instant the task may be dispatched; set while a retry backs off.
    pub not_before: Option<Instant>,
}

impl QueueEntry {
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

/// Priority queue of task ids: descending priority, FIFO within a band.
///
/// New tasks take increasing positive sequence numbers and land at the back
/// of their band. Retried or released tasks take decreasing negative ones and
/// land at the front.
pub struct TaskQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<TaskId, QueueKey>,
    next_back: i64,
    next_front: i64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_back: 1,
            next_front: -1,
        }
    }

    /// Enqueue a newly submitted task behind others of the same priority.
    pub fn push_back(&mut self, task_id: TaskId, priority: i32) {
        let seq = self.next_back;
        self.next_back += 1;
        self.insert((Reverse(priority), seq), task_id, priority, None);
    }

    /// Enqueue a task ahead of others of the same priority.
    pub fn push_front(&mut self, task_id: TaskId, priority: i32, not_before: Option<Instant>) {
        let seq = self.next_front;
        self.next_front -= 1;
        self.insert((Reverse(priority), seq), task_id, priority, not_before);
    }

    fn insert(&mut self, key: QueueKey, task_id: TaskId, priority: i32, not_before: Option<Instant>) {
        // a task is queued at most once
        self.remove(task_id);
        self.entries.insert(
            key,
            QueueEntry {
                task_id,
                priority,
                not_before,
            },
        );
        self.index.insert(task_id, key);
    }

    /// Remove a task. Returns `true` if it was queued.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        match self.index.remove(&task_id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.index.contains_key(&task_id)
    }

    /// Entries in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    /// Task ids in dispatch order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.values().map(|e| e.task_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain every entry, in dispatch order.
    pub fn drain(&mut self) -> Vec<TaskId> {
        self.index.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|e| e.task_id)
            .collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
