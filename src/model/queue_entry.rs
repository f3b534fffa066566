use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::task::Priority;

/// A task's position in the queue: `(priority_rank, enqueue_seq)`, ascending.
///
/// `enqueue_seq` is assigned at enqueue time and preserved across a crash
/// recovery (`load_pending` restores the original value), but a nack
/// allocates a fresh one on requeue so a retried task rejoins the tail of
/// its priority class instead of cutting back in at its old position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: String,
    pub priority: Priority,
    pub enqueue_seq: u64,
}

impl QueueEntry {
    pub fn new(task_id: impl Into<String>, priority: Priority, enqueue_seq: u64) -> Self {
        Self {
            task_id: task_id.into(),
            priority,
            enqueue_seq,
        }
    }

    fn sort_key(&self) -> (u8, u64) {
        (self.priority.rank(), self.enqueue_seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Lower sort key (higher priority, earlier enqueue) sorts greater, so a
    /// max-heap (`std::collections::BinaryHeap`) pops the true head first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.sort_key().cmp(&self.sort_key())
    }
}
