use std::collections::VecDeque;
use std::sync::Mutex;

use crate::tasks::Task;

// Insertion-ordered FIFO shared between the control surface, the worker
// read loops (retry path) and the dispatcher. One instance backs the ready
// queue, another the dead-letter queue.
#[derive(Default)]
pub struct TaskQueue {
    items: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: Task) {
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .push_back(task);
    }

    pub fn try_dequeue(&self) -> Option<Task> {
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .pop_front()
    }

    // Pops the head only if it is still the expected task; the head may
    // have moved between the dispatcher's peek and its dequeue.
    pub fn try_dequeue_expected(&self, expected_id: &str) -> Option<Task> {
        let mut items = self.items.lock().expect("task queue lock poisoned");
        if items.front().map(|task| task.id.as_str()) == Some(expected_id) {
            items.pop_front()
        } else {
            None
        }
    }

    pub fn peek_front(&self) -> Option<Task> {
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .front()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("task queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain_all(&self) -> Vec<Task> {
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.items
            .lock()
            .expect("task queue lock poisoned")
            .iter()
            .map(|task| task.id.clone())
            .collect()
    }
}
