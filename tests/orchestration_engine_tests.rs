// Black-box integration tests for the orchestration engine's two public
// entry points, driven entirely through scripted `ClientWrapper` replies and
// a registered typed worker. No network access.

use async_trait::async_trait;
use cloudllm::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use cloudllm::cloudllm::agent_executor::{ExecutionContext, WorkerAgent, WorkerRegistry};
use cloudllm::cloudllm::config::EngineConfig;
use cloudllm::cloudllm::planner::AvailableAgent;
use cloudllm::cloudllm::task_schema::TaskSchemaRegistry;
use cloudllm::cloudllm::workflow::{AgentError, AgentResult};
use cloudllm::cloudllm::workflow_repository::InMemoryWorkflowRepository;
use cloudllm::OrchestrationEngine;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Replies with a fixed script, one entry per `send_message` call, holding on
/// the last entry once the script runs out.
struct ScriptedCompletion {
    replies: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    fn new(replies: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            replies: replies.into_iter().map(String::from).collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ClientWrapper for ScriptedCompletion {
    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .get(index)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default();
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from(reply.as_str()),
            tool_calls: vec![],
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Typed worker that always completes immediately with a canned payload.
struct StaticWorker {
    id: &'static str,
    output: &'static str,
}

#[async_trait]
impl WorkerAgent for StaticWorker {
    fn agent_id(&self) -> &str {
        self.id
    }

    async fn execute_task(&self, _description: &str, _context: &ExecutionContext) -> AgentResult {
        AgentResult::completed(serde_json::json!({ "output": self.output }))
    }
}

/// Typed worker that always fails, to exercise replan/circuit-breaker paths.
struct FailingWorker {
    id: &'static str,
}

#[async_trait]
impl WorkerAgent for FailingWorker {
    fn agent_id(&self) -> &str {
        self.id
    }

    async fn execute_task(&self, _description: &str, _context: &ExecutionContext) -> AgentResult {
        AgentResult::failed(AgentError::new("WORKER_DOWN", "simulated failure"))
    }
}

fn worker_agent() -> AvailableAgent {
    AvailableAgent {
        id: "writer".to_string(),
        name: "Writer".to_string(),
        agent_type: "worker".to_string(),
        description: "writes a report".to_string(),
    }
}

fn greeter_agent() -> AvailableAgent {
    AvailableAgent {
        id: "greeter".to_string(),
        name: "Greeter".to_string(),
        agent_type: "qa".to_string(),
        description: "greets the user".to_string(),
    }
}

/// Worker step completes, then a closing Q&A step runs without pausing for
/// input (its gate is satisfied immediately), driving the workflow straight
/// through to finalization.
#[tokio::test]
async fn worker_then_qa_step_runs_to_completion() {
    let plan = r#"{"analysis": "write then confirm", "steps": [
        {"agent_id": "writer", "agent_name": "Writer", "role": "worker",
         "description": "write a short report"},
        {"agent_id": "greeter", "agent_name": "Greeter", "role": "q_and_a",
         "description": "close out the task"}
    ]}"#;
    let qa_completed = r#"{"status": "COMPLETED", "message": ""}"#;
    let narration = "All done, report delivered.";

    let completion = ScriptedCompletion::new(vec![plan, qa_completed, narration]);

    let mut workers = WorkerRegistry::new();
    workers.register(Arc::new(StaticWorker {
        id: "writer",
        output: "quarterly numbers look healthy",
    }));

    let engine = OrchestrationEngine::new(
        completion,
        workers,
        Arc::new(InMemoryWorkflowRepository::new()),
        TaskSchemaRegistry::new(),
        EngineConfig::default(),
    );

    let outcome = engine
        .process_request(
            "report-task",
            "write me a report",
            vec![worker_agent(), greeter_agent()],
            None,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.as_deref(), Some(narration));
}

/// The Q&A step asks a question and the engine pauses; once the caller
/// resumes with the user's answer the workflow drives to completion and
/// the closing message is delivered as a `task_interaction` event as well
/// as the return value.
#[tokio::test]
async fn qa_pause_then_resume_emits_interaction_event() {
    let plan = r#"{"analysis": "greet", "steps": [
        {"agent_id": "greeter", "agent_name": "Greeter", "role": "q_and_a",
         "description": "greet and ask for a name", "user_prompt": "What's your name?"}
    ]}"#;
    let qa_completed = r#"{"status": "COMPLETED", "message": ""}"#;
    let narration = "Nice to meet you, Ada!";

    let completion = ScriptedCompletion::new(vec![plan, qa_completed, narration]);
    let engine = OrchestrationEngine::new(
        completion,
        WorkerRegistry::new(),
        Arc::new(InMemoryWorkflowRepository::new()),
        TaskSchemaRegistry::new(),
        EngineConfig::default(),
    );

    let paused = engine
        .process_request(
            "greet-task",
            "say hi",
            vec![greeter_agent()],
            None,
            CancellationToken::new(),
        )
        .await;
    assert!(paused.is_none());

    let events_while_paused = engine.events().task_events("greet-task");
    assert!(events_while_paused
        .iter()
        .any(|e| e.event_type == "task_interaction"));

    let resumed = engine
        .resume_with_user_input("greet-task", "Ada", CancellationToken::new())
        .await;
    assert_eq!(resumed.as_deref(), Some(narration));

    let events_after = engine.events().task_events("greet-task");
    assert!(events_after.len() >= events_while_paused.len());
}

/// A worker that always fails drives a replan; when the replanned plan still
/// can't make progress the workflow ends in failure rather than looping
/// forever.
#[tokio::test]
async fn repeated_worker_failure_ends_in_failure_after_replan() {
    let plan = r#"{"analysis": "do it", "steps": [
        {"agent_id": "flaky", "agent_name": "Flaky", "role": "worker",
         "description": "do the thing"}
    ]}"#;
    // Replan keeps retrying the same broken worker; every planner call
    // reuses this script entry once the initial plan is consumed.
    let completion = ScriptedCompletion::new(vec![plan]);

    let mut workers = WorkerRegistry::new();
    workers.register(Arc::new(FailingWorker { id: "flaky" }));

    let engine = OrchestrationEngine::new(
        completion,
        workers,
        Arc::new(InMemoryWorkflowRepository::new()),
        TaskSchemaRegistry::new(),
        EngineConfig::default(),
    );

    let outcome = engine
        .process_request(
            "flaky-task",
            "do the flaky thing",
            vec![AvailableAgent {
                id: "flaky".to_string(),
                name: "Flaky".to_string(),
                agent_type: "worker".to_string(),
                description: "always fails".to_string(),
            }],
            None,
            CancellationToken::new(),
        )
        .await;

    let message = outcome.expect("a failed workflow still returns a message");
    assert!(message.to_lowercase().contains("couldn't") || message.to_lowercase().contains("failed"));
}

/// An empty agent roster means the planner has nothing to work with and the
/// request fails immediately without dispatching anything.
#[tokio::test]
async fn empty_agent_roster_fails_fast() {
    let completion = ScriptedCompletion::new(vec!["irrelevant"]);
    let engine = OrchestrationEngine::new(
        completion,
        WorkerRegistry::new(),
        Arc::new(InMemoryWorkflowRepository::new()),
        TaskSchemaRegistry::new(),
        EngineConfig::default(),
    );

    let outcome = engine
        .process_request(
            "no-agents-task",
            "do anything",
            vec![],
            None,
            CancellationToken::new(),
        )
        .await;
    assert!(outcome.is_some());
}
