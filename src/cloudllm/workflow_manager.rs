//! §4.2 Workflow Manager — a map from `taskId` to [`Workflow`] with
//! per-task serialization. A per-task `tokio::sync::Mutex` is created on
//! demand under a short-lived global lock; once created it is never shared
//! between tasks, and it is held across the whole execution loop for that
//! task (including any agent call) so that `ResumeWithUserInput` cannot
//! interleave with an in-flight step (§5).

use crate::cloudllm::workflow::{Workflow, WorkflowPhase};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Owns the set of workflows keyed by `taskId` and the per-task locks that
/// guard them. Cheap to clone (an `Arc` handle) so it can be shared by the
/// engine and any background maintenance task.
#[derive(Clone)]
pub struct WorkflowManager {
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<Option<Workflow>>>>>>,
}

/// An exclusive, locked view onto one task's workflow. Holding this guard
/// across an agent call is what gives §5's "no interleaving" guarantee.
/// Owns the `Arc<Mutex<_>>` it was locked from, so it carries no borrowed
/// lifetime back to the manager.
pub struct WorkflowHandle {
    guard: OwnedMutexGuard<Option<Workflow>>,
}

impl WorkflowHandle {
    pub fn get(&self) -> Option<&Workflow> {
        self.guard.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Workflow> {
        self.guard.as_mut()
    }

    pub fn set(&mut self, workflow: Workflow) {
        *self.guard = Some(workflow);
    }

    pub fn clear(&mut self) {
        *self.guard = None;
    }
}

impl WorkflowManager {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, task_id: &str) -> Arc<Mutex<Option<Workflow>>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Acquire the per-task lock and hold it for the duration of the caller's
    /// critical section (including any agent I/O the caller performs while
    /// holding the returned handle).
    pub async fn lock(&self, task_id: &str) -> WorkflowHandle {
        let task_lock = self.lock_for(task_id);
        let guard = task_lock.lock_owned().await;
        WorkflowHandle { guard }
    }

    pub async fn create(&self, task_id: &str, original_request: &str) {
        let mut handle = self.lock(task_id).await;
        handle.set(Workflow::new(task_id, original_request));
    }

    pub async fn has_pending_workflow(&self, task_id: &str) -> bool {
        let handle = self.lock(task_id).await;
        matches!(
            handle.get().map(|w| w.phase),
            Some(WorkflowPhase::WaitingUser)
        )
    }

    pub async fn remove(&self, task_id: &str) {
        self.locks.lock().unwrap().remove(task_id);
    }

    /// Garbage-collect completed/failed workflows whose `updated_at` is
    /// older than `older_than`. Requires the caller to supply "now" since
    /// this module must not call `Utc::now()` for anything that affects
    /// event ordering (§9) — here it only affects TTL bookkeeping, so a
    /// passed-in timestamp keeps the function pure and testable.
    pub async fn cleanup_completed(&self, now: DateTime<Utc>, older_than: chrono::Duration) {
        let task_ids: Vec<String> = self.locks.lock().unwrap().keys().cloned().collect();
        for task_id in task_ids {
            let mut handle = self.lock(&task_id).await;
            let should_remove = match handle.get() {
                Some(w) => {
                    matches!(w.phase, WorkflowPhase::Completed | WorkflowPhase::Failed)
                        && now.signed_duration_since(w.updated_at) > older_than
                }
                None => false,
            };
            if should_remove {
                handle.clear();
                drop(handle);
                self.remove(&task_id).await;
            }
        }
    }
}

impl Default for WorkflowManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_read_back() {
        let manager = WorkflowManager::new();
        manager.create("t1", "say hi").await;
        let handle = manager.lock("t1").await;
        assert_eq!(handle.get().unwrap().original_request, "say hi");
    }

    #[tokio::test]
    async fn per_task_lock_serializes_mutation() {
        let manager = WorkflowManager::new();
        manager.create("t1", "say hi").await;
        {
            let mut handle = manager.lock("t1").await;
            handle.get_mut().unwrap().phase = WorkflowPhase::Executing;
        }
        let handle = manager.lock("t1").await;
        assert_eq!(handle.get().unwrap().phase, WorkflowPhase::Executing);
    }

    #[tokio::test]
    async fn has_pending_workflow_reflects_phase() {
        let manager = WorkflowManager::new();
        manager.create("t1", "say hi").await;
        assert!(!manager.has_pending_workflow("t1").await);
        {
            let mut handle = manager.lock("t1").await;
            handle.get_mut().unwrap().phase = WorkflowPhase::WaitingUser;
        }
        assert!(manager.has_pending_workflow("t1").await);
    }
}
