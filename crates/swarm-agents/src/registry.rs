//! Task registry
//!
//! One registry per orchestrator instance. Admission checks scan the live
//! map and insert under the same lock, so counts are always derived from
//! registry truth and two racing admissions cannot both pass a full limit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::task::TaskRecord;

/// Read-only view over the registry handed to admission checks
pub struct Scan<'a, T> {
    tasks: &'a HashMap<String, T>,
}

impl<T: TaskRecord> Scan<'_, T> {
    /// Number of running tasks matching `pred`
    pub fn running(&self, pred: impl Fn(&T) -> bool) -> usize {
        self.tasks
            .values()
            .filter(|t| t.is_running() && pred(t))
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }
}

/// Concurrent map from task id to task record
pub struct TaskRegistry<T> {
    tasks: Mutex<HashMap<String, T>>,
}

impl<T: TaskRecord> TaskRegistry<T> {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, T>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `admit` against the current contents and insert its record, all
    /// under one lock. Nothing is inserted when `admit` fails.
    pub fn try_insert_with<E>(
        &self,
        admit: impl FnOnce(&Scan<'_, T>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let mut tasks = self.lock();
        let record = admit(&Scan { tasks: &tasks })?;
        tasks.insert(record.id().to_string(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().get(id).cloned()
    }

    /// Terminal transition for a running task. Returns the updated record, or
    /// `None` when the task is gone or already terminal.
    pub fn complete(&self, id: &str, status: swarm_core::TaskStatus, result: Option<String>) -> Option<T> {
        let mut tasks = self.lock();
        let task = tasks.get_mut(id)?;
        if task.finish(status, result) {
            Some(task.clone())
        } else {
            None
        }
    }

    /// Cancel a running task: fire its token, mark it cancelled and remove it.
    /// Returns `None` for unknown or already-terminal tasks.
    pub fn cancel(&self, id: &str) -> Option<T> {
        let mut tasks = self.lock();
        if !tasks.get(id).is_some_and(|t| t.is_running()) {
            return None;
        }
        let mut task = tasks.remove(id)?;
        drop(tasks);

        task.cancel_token().cancel();
        task.finish(swarm_core::TaskStatus::Cancelled, None);
        Some(task)
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.lock().remove(id)
    }

    /// Number of running tasks matching `pred`
    pub fn count_running(&self, pred: impl Fn(&T) -> bool) -> usize {
        Scan { tasks: &self.lock() }.running(pred)
    }

    /// Snapshot of records matching `pred`
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.lock().values().filter(|t| pred(t)).cloned().collect()
    }

    /// Records still running, for shutdown
    pub fn running(&self) -> Vec<T> {
        self.filter(|t| t.is_running())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Cancels a registered task when dropped while still armed.
///
/// Held across a run the caller awaits inline, so dropping that future
/// before the terminal transition does not leave a running record behind.
pub struct AbandonGuard<'a, T: TaskRecord> {
    registry: &'a TaskRegistry<T>,
    id: String,
    on_cancel: Option<Box<dyn FnOnce(&T) + Send + 'a>>,
}

impl<'a, T: TaskRecord> AbandonGuard<'a, T> {
    /// `on_cancel` runs with the cancelled record if the guard fires
    pub fn new(
        registry: &'a TaskRegistry<T>,
        id: impl Into<String>,
        on_cancel: impl FnOnce(&T) + Send + 'a,
    ) -> Self {
        Self {
            registry,
            id: id.into(),
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    pub fn disarm(mut self) {
        self.on_cancel = None;
    }
}

impl<T: TaskRecord> Drop for AbandonGuard<'_, T> {
    fn drop(&mut self) {
        let Some(on_cancel) = self.on_cancel.take() else {
            return;
        };
        if let Some(task) = self.registry.cancel(&self.id) {
            on_cancel(&task);
        }
    }
}

impl<T: TaskRecord> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
