use crate::error::{EngineError, Result};
use crate::task::types::*;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Priority-bucketed holding area for pending tasks.
///
/// One FIFO bucket per priority level, plus an id index kept in lockstep with
/// the buckets. Enqueue is O(1); dequeue scans at most five buckets.
#[derive(Debug, Default)]
pub struct PriorityTaskQueue {
    buckets: [VecDeque<TaskId>; 5],
    index: HashMap<TaskId, Task>,
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the tail of its priority bucket.
    ///
    /// Fails with `DuplicateTask` if the id is already queued; the queued task
    /// is left untouched.
    pub fn enqueue(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(EngineError::DuplicateTask(task.id));
        }

        self.buckets[task.priority.index()].push_back(task.id.clone());
        debug!(
            "Enqueued task {} at priority {}",
            task.id,
            task.priority.value()
        );
        self.index.insert(task.id.clone(), task);
        Ok(())
    }

    /// Remove and return the oldest task of the most urgent non-empty bucket
    pub fn dequeue(&mut self) -> Option<Task> {
        for bucket in self.buckets.iter_mut() {
            while let Some(id) = bucket.pop_front() {
                if let Some(task) = self.index.remove(&id) {
                    return Some(task);
                }
            }
        }
        None
    }

    pub fn peek(&self) -> Option<&Task> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .find_map(|id| self.index.get(id))
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        let task = self.index.remove(task_id)?;
        self.buckets[task.priority.index()].retain(|id| id != task_id);
        Some(task)
    }

    /// Apply `patch` to a queued task.
    ///
    /// The id cannot change. A priority change moves the task to the tail of
    /// its new bucket.
    pub fn update<F>(&mut self, task_id: &str, patch: F) -> Result<&Task>
    where
        F: FnOnce(&mut Task),
    {
        let task = self
            .index
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        let old_priority = task.priority;
        patch(task);
        task.id = task_id.to_string();

        if task.priority != old_priority {
            let new_priority = task.priority;
            self.buckets[old_priority.index()].retain(|id| id != task_id);
            self.buckets[new_priority.index()].push_back(task_id.to_string());
        }

        self.index
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// Queued tasks matching `filter`, in dequeue order
    pub fn filter(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.iter().filter(|task| filter.matches(task)).collect()
    }

    /// Iterate queued tasks in dequeue order
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter_map(|id| self.index.get(id))
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.index.get(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.index.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of queued tasks per priority level, most urgent first
    pub fn bucket_sizes(&self) -> [usize; 5] {
        let mut sizes = [0; 5];
        for (size, bucket) in sizes.iter_mut().zip(self.buckets.iter()) {
            *size = bucket.len();
        }
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, priority: TaskPriority) -> Task {
        Task::new("test", json!({})).with_id(id).with_priority(priority)
    }

    #[test]
    fn test_dequeue_by_priority() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(task("p1", TaskPriority::Critical)).unwrap();
        queue.enqueue(task("p3", TaskPriority::Normal)).unwrap();
        queue.enqueue(task("p2", TaskPriority::High)).unwrap();

        assert_eq!(queue.dequeue().unwrap().id, "p1");
        assert_eq!(queue.dequeue().unwrap().id, "p2");
        assert_eq!(queue.dequeue().unwrap().id, "p3");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_within_priority_including_requeue() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(task("a", TaskPriority::Normal)).unwrap();
        queue.enqueue(task("b", TaskPriority::Normal)).unwrap();

        let first = queue.dequeue().unwrap();
        assert_eq!(first.id, "a");
        queue.enqueue(task("c", TaskPriority::Normal)).unwrap();
        queue.enqueue(first).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|t| t.id).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_duplicate_rejected_and_original_kept() {
        let mut queue = PriorityTaskQueue::new();
        queue
            .enqueue(task("dup", TaskPriority::Low).with_max_attempts(7))
            .unwrap();

        let err = queue
            .enqueue(task("dup", TaskPriority::Critical))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask(ref id) if id == "dup"));

        let kept = queue.get("dup").unwrap();
        assert_eq!(kept.priority, TaskPriority::Low);
        assert_eq!(kept.metadata.max_attempts, 7);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.bucket_sizes(), [0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_peek_remove_update() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(task("x", TaskPriority::Low)).unwrap();
        queue.enqueue(task("y", TaskPriority::Low)).unwrap();
        assert_eq!(queue.peek().unwrap().id, "x");

        queue
            .update("y", |t| t.priority = TaskPriority::Critical)
            .unwrap();
        assert_eq!(queue.peek().unwrap().id, "y");

        assert!(queue.remove("y").is_some());
        assert!(queue.remove("y").is_none());
        assert_eq!(queue.peek().unwrap().id, "x");
        assert!(queue.update("missing", |_| {}).is_err());
    }

    #[test]
    fn test_update_cannot_change_id() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(task("keep", TaskPriority::Normal)).unwrap();
        let updated = queue.update("keep", |t| t.id = "other".into()).unwrap();
        assert_eq!(updated.id, "keep");
        assert!(queue.contains("keep"));
    }

    #[test]
    fn test_filter() {
        let mut queue = PriorityTaskQueue::new();
        queue.enqueue(task("a", TaskPriority::High)).unwrap();
        queue
            .enqueue(Task::new("other", json!(null)).with_id("b"))
            .unwrap();

        let by_type = queue.filter(&TaskFilter {
            task_type: Some("other".into()),
            ..Default::default()
        });
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, "b");

        let by_priority = queue.filter(&TaskFilter {
            priority: Some(TaskPriority::High),
            status: Some(TaskStatus::Pending),
            ..Default::default()
        });
        assert_eq!(by_priority.len(), 1);
        assert_eq!(by_priority[0].id, "a");

        let future = queue.filter(&TaskFilter {
            created_after: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        });
        assert!(future.is_empty());
    }
}
