// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access.
pub use cloudllm::client_wrapper::{ClientWrapper, Message, Role};
pub use cloudllm::orchestration_engine::OrchestrationEngine;
pub use cloudllm::workflow::{AgentResult, ConversationState, Step, Workflow};

/// Initialize `env_logger` from `RUST_LOG` (or `info` if unset). Safe to
/// call more than once; subsequent calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
