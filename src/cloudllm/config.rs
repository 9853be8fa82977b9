//! Configuration for the orchestration engine (§10 Ambient Stack).
//!
//! Provides [`EngineConfig`] and [`RepositoryBackend`]. Every field has a
//! `Default` matching the values named in the component design sections; no
//! TOML/YAML/file-parsing dependency is introduced, and users construct
//! these structs directly (or via [`EngineConfig::default`] plus field
//! overrides).
//!
//! # Example
//!
//! ```rust
//! use cloudllm::cloudllm::config::{EngineConfig, RepositoryBackend};
//! use std::path::PathBuf;
//!
//! let config = EngineConfig {
//!     repository_backend: RepositoryBackend::File { dir: PathBuf::from("/var/data/workflows") },
//!     ..EngineConfig::default()
//! };
//! ```

use crate::cloudllm::circuit_breaker::CircuitBreakerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Which [`crate::cloudllm::workflow_repository::WorkflowRepository`]
/// backend the engine should use.
#[derive(Debug, Clone)]
pub enum RepositoryBackend {
    InMemory,
    File { dir: PathBuf },
}

impl Default for RepositoryBackend {
    fn default() -> Self {
        RepositoryBackend::InMemory
    }
}

/// Every tunable the orchestration engine itself needs, gathered in one
/// place. Construct with `EngineConfig::default()` and override individual
/// fields.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    /// Wall-clock budget for a single worker or Q&A agent call.
    pub agent_call_timeout: Duration,
    /// Ring buffer size for [`crate::cloudllm::event_store::EventStore`]'s
    /// global event log.
    pub event_store_global_capacity: usize,
    /// Ring buffer size for each task's own event log.
    pub event_store_per_task_capacity: usize,
    pub repository_backend: RepositoryBackend,
    /// How long a completed/failed workflow is kept before
    /// [`crate::cloudllm::workflow_manager::WorkflowManager::cleanup_completed`]
    /// considers it eligible for removal.
    pub completed_workflow_ttl: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            agent_call_timeout: Duration::from_secs(30),
            event_store_global_capacity: 1000,
            event_store_per_task_capacity: 500,
            repository_backend: RepositoryBackend::InMemory,
            completed_workflow_ttl: chrono::Duration::hours(1),
        }
    }
}
