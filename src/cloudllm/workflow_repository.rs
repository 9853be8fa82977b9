//! §4.9 Workflow Repository — pluggable persistence for [`Workflow`].
//!
//! Every phase transition and any advance/context mutation is followed by a
//! `save` before the engine releases the per-task lock, so a crash-and-restart
//! can always rebuild from the last persisted step.

use crate::cloudllm::workflow::Workflow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save(&self, workflow: &Workflow) -> io::Result<()>;
    async fn load(&self, task_id: &str) -> io::Result<Option<Workflow>>;
    async fn delete(&self, task_id: &str) -> io::Result<()>;
    async fn list_all(&self) -> io::Result<Vec<Workflow>>;
    async fn exists(&self, task_id: &str) -> io::Result<bool>;
}

/// Default backend: an in-process map. Fastest, but loses everything on
/// process exit — appropriate for tests and for deployments that accept
/// losing in-flight workflows on restart.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: Arc<Mutex<HashMap<String, Workflow>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save(&self, workflow: &Workflow) -> io::Result<()> {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.task_id.clone(), workflow.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> io::Result<Option<Workflow>> {
        Ok(self.workflows.lock().unwrap().get(task_id).cloned())
    }

    async fn delete(&self, task_id: &str) -> io::Result<()> {
        self.workflows.lock().unwrap().remove(task_id);
        Ok(())
    }

    async fn list_all(&self) -> io::Result<Vec<Workflow>> {
        Ok(self.workflows.lock().unwrap().values().cloned().collect())
    }

    async fn exists(&self, task_id: &str) -> io::Result<bool> {
        Ok(self.workflows.lock().unwrap().contains_key(task_id))
    }
}

/// One JSON file per task, named by a filesystem-safe transform of the task
/// id. Unknown fields on load are ignored automatically by `serde` unless a
/// `#[serde(deny_unknown_fields)]` attribute is added — [`Workflow`]
/// deliberately has none, so this repository is forward-compatible with
/// schema additions the way §4.9 requires.
#[derive(Clone)]
pub struct FileWorkflowRepository {
    dir: PathBuf,
}

impl FileWorkflowRepository {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl WorkflowRepository for FileWorkflowRepository {
    async fn save(&self, workflow: &Workflow) -> io::Result<()> {
        let path = self.path_for(&workflow.task_id);
        let json = serde_json::to_string_pretty(workflow)
            .map_err(|e| io::Error::other(format!("failed to serialize workflow: {}", e)))?;
        fs::write(path, json)
    }

    async fn load(&self, task_id: &str) -> io::Result<Option<Workflow>> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let workflow = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("failed to parse workflow: {}", e)))?;
        Ok(Some(workflow))
    }

    async fn delete(&self, task_id: &str) -> io::Result<()> {
        let path = self.path_for(task_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn list_all(&self) -> io::Result<Vec<Workflow>> {
        let mut workflows = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(entry.path())?;
            if let Ok(workflow) = serde_json::from_str(&raw) {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    async fn exists(&self, task_id: &str) -> io::Result<bool> {
        Ok(self.path_for(task_id).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::workflow::Workflow;

    #[tokio::test]
    async fn in_memory_round_trips() {
        let repo = InMemoryWorkflowRepository::new();
        let workflow = Workflow::new("t1", "say hi");
        repo.save(&workflow).await.unwrap();
        let loaded = repo.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.task_id, "t1");
        assert!(repo.exists("t1").await.unwrap());
        repo.delete("t1").await.unwrap();
        assert!(!repo.exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn file_backend_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileWorkflowRepository::new(tmp.path()).unwrap();
        let mut workflow = Workflow::new("task/with weird:chars", "say hi");
        workflow.context.insert("foo".to_string(), serde_json::json!("bar"));
        repo.save(&workflow).await.unwrap();

        let loaded = repo
            .load("task/with weird:chars")
            .await
            .unwrap()
            .expect("workflow should round-trip");
        assert_eq!(loaded.task_id, workflow.task_id);
        assert_eq!(loaded.context.get("foo").unwrap(), "bar");

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
