//! §4.8 Agent Executor — dispatches a [`Step`] to either a registered
//! [`WorkerAgent`] (typed worker) or a generic LLM-synthesized prompt
//! (generic worker).

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role};
use crate::cloudllm::workflow::{AgentError, AgentResult, ConversationState, Step, Workflow};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// A previously completed step's result, flattened for downstream prompts
/// and for the typed-worker execution context.
#[derive(Debug, Clone, Serialize)]
pub struct PriorResult {
    pub agent: String,
    pub result: String,
}

/// Everything a [`WorkerAgent`] needs to execute one step, per the agent
/// contract in §6.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub task_id: String,
    pub original_request: String,
    pub user_input: Option<String>,
    pub previous_results: Vec<PriorResult>,
    pub facts: HashMap<String, serde_json::Value>,
    pub decisions: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn build(workflow: &Workflow, user_input: Option<String>) -> Self {
        let previous_results: Vec<PriorResult> = workflow
            .steps
            .iter()
            .filter(|s| matches!(s.status, crate::cloudllm::workflow::StepStatus::Completed))
            .filter_map(|s| {
                s.result.clone().map(|result| PriorResult {
                    agent: s.agent_name.clone(),
                    result,
                })
            })
            .collect();

        let (facts, decisions) = workflow
            .conversation_state
            .as_ref()
            .map(|s| (s.facts.clone(), s.decisions.clone()))
            .unwrap_or_default();

        Self {
            task_id: workflow.task_id.clone(),
            original_request: workflow.original_request.clone(),
            user_input,
            previous_results,
            facts,
            decisions,
        }
    }
}

/// The external, side-effecting integration a typed worker step dispatches
/// to (messaging, document generation, and the like). Concrete
/// implementations live entirely outside this crate; the core only needs
/// this trait object.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Stable identifier matching `Step::agent_id`.
    fn agent_id(&self) -> &str;

    async fn execute_task(
        &self,
        description: &str,
        context: &ExecutionContext,
    ) -> AgentResult;
}

/// Registry of typed workers, looked up by agent id.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn WorkerAgent>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn WorkerAgent>) {
        self.workers.insert(worker.agent_id().to_string(), worker);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn WorkerAgent>> {
        self.workers.get(agent_id).cloned()
    }
}

/// Runs a [`Step`] with role `Worker`: typed-worker path if the agent is
/// registered, generic LLM-synthesis path otherwise.
pub struct AgentExecutor {
    workers: WorkerRegistry,
    completion: Arc<dyn ClientWrapper>,
}

impl AgentExecutor {
    pub fn new(workers: WorkerRegistry, completion: Arc<dyn ClientWrapper>) -> Self {
        Self { workers, completion }
    }

    pub async fn execute(
        &self,
        workflow: &Workflow,
        step: &Step,
        user_input: Option<String>,
    ) -> AgentResult {
        let context = ExecutionContext::build(workflow, user_input);

        if let Some(worker) = self.workers.get(&step.agent_id) {
            return worker.execute_task(&step.description, &context).await;
        }

        match self.generic_worker(step, &context).await {
            Ok(text) if !text.trim().is_empty() => {
                AgentResult::completed(serde_json::json!({ "output": text }))
            }
            Ok(_) => AgentResult::failed(AgentError::new(
                "EMPTY_OUTPUT",
                format!("agent '{}' produced no output", step.agent_id),
            )),
            Err(err) => AgentResult::failed(AgentError::new("LLM_ERROR", err.to_string())),
        }
    }

    async fn generic_worker(
        &self,
        step: &Step,
        context: &ExecutionContext,
    ) -> Result<String, Box<dyn Error>> {
        let prompt = build_generic_worker_prompt(step, context);
        let response = self
            .completion
            .send_message(
                &[Message {
                    role: Role::User,
                    content: std::sync::Arc::from(prompt.as_str()),
                    tool_calls: vec![],
                }],
                None,
            )
            .await?;
        Ok(response.content.to_string())
    }
}

fn build_generic_worker_prompt(step: &Step, context: &ExecutionContext) -> String {
    let mut prompt = format!(
        "Original request: {}\n\nStep to perform: {}\n",
        context.original_request, step.description
    );

    if !context.previous_results.is_empty() {
        prompt.push_str("\nPrior step results:\n");
        for prior in &context.previous_results {
            prompt.push_str(&format!("- {}: {}\n", prior.agent, prior.result));
        }
    }

    if !context.facts.is_empty() {
        prompt.push_str("\nKnown facts:\n");
        for (key, value) in &context.facts {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
    }

    if !context.decisions.is_empty() {
        prompt.push_str("\nUser decisions:\n");
        for (key, value) in &context.decisions {
            prompt.push_str(&format!("- {}: {}\n", key, value));
        }
    }

    if let Some(input) = &context.user_input {
        prompt.push_str(&format!("\nCurrent user input: {}\n", input));
    }

    prompt.push_str("\nPerform this step and respond with the result only.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::workflow::{StepRole, Workflow};
    use async_trait::async_trait as at;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct FakeError(String);
    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl StdError for FakeError {}

    struct FakeCompletion {
        reply: String,
    }

    #[at]
    impl ClientWrapper for FakeCompletion {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::cloudllm::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn StdError>> {
            Ok(Message {
                role: Role::Assistant,
                content: std::sync::Arc::from(self.reply.as_str()),
                tool_calls: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "fake-model"
        }
    }

    struct EchoWorker;

    #[at]
    impl WorkerAgent for EchoWorker {
        fn agent_id(&self) -> &str {
            "echo"
        }

        async fn execute_task(&self, description: &str, _context: &ExecutionContext) -> AgentResult {
            AgentResult::completed(serde_json::json!({ "output": format!("echo: {}", description) }))
        }
    }

    #[tokio::test]
    async fn typed_worker_path_is_used_when_registered() {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(EchoWorker));
        let executor = AgentExecutor::new(
            registry,
            Arc::new(FakeCompletion {
                reply: "unused".into(),
            }),
        );
        let workflow = Workflow::new("t1", "do a thing");
        let step = crate::cloudllm::workflow::Step::new(
            "s1", "echo", "Echo Agent", StepRole::Worker, "say hi", 1,
        );
        let result = executor.execute(&workflow, &step, None).await;
        assert_eq!(result.step_result_text().unwrap(), "echo: say hi");
    }

    #[tokio::test]
    async fn generic_worker_path_used_when_unregistered() {
        let executor = AgentExecutor::new(
            WorkerRegistry::new(),
            Arc::new(FakeCompletion {
                reply: "the answer is 42".into(),
            }),
        );
        let workflow = Workflow::new("t1", "do a thing");
        let step = crate::cloudllm::workflow::Step::new(
            "s1", "generic", "Generic Agent", StepRole::Worker, "answer the question", 1,
        );
        let result = executor.execute(&workflow, &step, None).await;
        assert_eq!(result.step_result_text().unwrap(), "the answer is 42");
    }

    #[tokio::test]
    async fn empty_generic_output_fails() {
        let executor = AgentExecutor::new(
            WorkerRegistry::new(),
            Arc::new(FakeCompletion { reply: "   ".into() }),
        );
        let workflow = Workflow::new("t1", "do a thing");
        let step = crate::cloudllm::workflow::Step::new(
            "s1", "generic", "Generic Agent", StepRole::Worker, "answer", 1,
        );
        let result = executor.execute(&workflow, &step, None).await;
        assert_eq!(result.status, crate::cloudllm::workflow::AgentStatus::Failed);
    }
}
