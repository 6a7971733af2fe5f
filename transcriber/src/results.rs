use shared_protocol::{TaskStatus, Transcript};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Pending,
    Completed(Transcript),
    Failed(String),
}

impl TaskResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskResult::Pending)
    }
}

impl From<TaskResult> for TaskStatus {
    fn from(result: TaskResult) -> Self {
        match result {
            TaskResult::Pending => TaskStatus::Pending,
            TaskResult::Completed(result) => TaskStatus::Completed { result },
            TaskResult::Failed(error) => TaskStatus::Failed { error },
        }
    }
}

/// Outcomes of async tasks, each handed out to a single poll.
#[derive(Default)]
pub struct ResultStore {
    entries: Mutex<HashMap<String, TaskResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_pending(&self, task_id: &str) {
        self.lock().insert(task_id.to_string(), TaskResult::Pending);
    }

    pub fn put(&self, task_id: &str, result: TaskResult) {
        self.lock().insert(task_id.to_string(), result);
    }

    /// Removes and returns a terminal result. Pending and unknown ids both
    /// read as `Pending` and leave the store untouched.
    pub fn take_if_done(&self, task_id: &str) -> TaskResult {
        let mut entries = self.lock();
        match entries.get(task_id) {
            Some(result) if result.is_terminal() => {
                entries.remove(task_id).unwrap_or(TaskResult::Pending)
            }
            _ => TaskResult::Pending,
        }
    }

    /// Entries not yet consumed, pending markers included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskResult>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
