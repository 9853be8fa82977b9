//! Orchestration Engine Demo
//!
//! Drives a single task through [`OrchestrationEngine`] end to end: the
//! planner breaks the request into steps, a typed worker produces a draft,
//! a Q&A step asks the user to confirm it, and the Final Narrator closes
//! the task out. Run with:
//!
//! ```text
//! OPEN_AI_SECRET=sk-... cargo run --example orchestration_demo
//! ```
//!
//! (This file lives under `demos/` rather than `examples/` in this tree and
//! is not wired into `Cargo.toml` as a `[[example]]`; copy it into an
//! `examples/` directory of your own project to run it as-is.)

use async_trait::async_trait;
use cloudllm::client_wrapper::ClientWrapper;
use cloudllm::cloudllm::agent_executor::{ExecutionContext, WorkerAgent, WorkerRegistry};
use cloudllm::cloudllm::clients::openai::{Model, OpenAIClient};
use cloudllm::cloudllm::config::EngineConfig;
use cloudllm::cloudllm::planner::AvailableAgent;
use cloudllm::cloudllm::task_schema::TaskSchemaRegistry;
use cloudllm::cloudllm::workflow::AgentResult;
use cloudllm::cloudllm::workflow_repository::InMemoryWorkflowRepository;
use cloudllm::OrchestrationEngine;
use std::io::{self, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A worker that drafts release notes from the task's original request.
struct ReleaseNotesWriter;

#[async_trait]
impl WorkerAgent for ReleaseNotesWriter {
    fn agent_id(&self) -> &str {
        "release-notes-writer"
    }

    async fn execute_task(&self, description: &str, context: &ExecutionContext) -> AgentResult {
        let draft = format!(
            "Release notes draft for '{}': {}",
            context.original_request, description
        );
        AgentResult::completed(serde_json::json!({ "output": draft }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cloudllm::init_logger();

    let api_key = std::env::var("OPEN_AI_SECRET")?;
    let completion: Arc<dyn ClientWrapper> =
        Arc::new(OpenAIClient::new_with_model_enum(&api_key, Model::GPT41Mini));

    let mut workers = WorkerRegistry::new();
    workers.register(Arc::new(ReleaseNotesWriter));

    let engine = OrchestrationEngine::new(
        completion,
        workers,
        Arc::new(InMemoryWorkflowRepository::new()),
        TaskSchemaRegistry::new(),
        EngineConfig::default(),
    );

    let available_agents = vec![
        AvailableAgent {
            id: "release-notes-writer".to_string(),
            name: "Release Notes Writer".to_string(),
            agent_type: "worker".to_string(),
            description: "drafts release notes from a short summary of changes".to_string(),
        },
        AvailableAgent {
            id: "editor".to_string(),
            name: "Editor".to_string(),
            agent_type: "qa".to_string(),
            description: "confirms the draft with the user before closing the task".to_string(),
        },
    ];

    let task_id = "demo-release-notes";
    let request = "Draft release notes for the v2.3 release: faster cold starts, \
                   fixed a crash in the exporter, and new dark mode support.";

    let cancellation = CancellationToken::new();
    let ctrl_c = cancellation.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    let mut outcome = engine
        .process_request(task_id, request, available_agents, None, cancellation.clone())
        .await;

    loop {
        match outcome {
            Some(message) => {
                println!("{}", message);
                break;
            }
            None => {
                print!("> ");
                io::stdout().flush()?;
                let mut input = String::new();
                io::stdin().read_line(&mut input)?;
                outcome = engine
                    .resume_with_user_input(task_id, input.trim(), cancellation.clone())
                    .await;
            }
        }
    }

    Ok(())
}
