//! §4.1 Orchestration Engine — the top-level controller. Wires together the
//! [`crate::cloudllm::planner::Planner`], [`crate::cloudllm::agent_executor::AgentExecutor`],
//! [`crate::cloudllm::qa_handler::QAHandler`]/[`crate::cloudllm::qa_handler::FinalNarrator`],
//! [`crate::cloudllm::circuit_breaker::CircuitBreaker`],
//! [`crate::cloudllm::workflow_manager::WorkflowManager`],
//! [`crate::cloudllm::workflow_repository::WorkflowRepository`], and
//! [`crate::cloudllm::event_store::EventStore`] into the two public entry points
//! named in the external interface: [`OrchestrationEngine::process_request`] and
//! [`OrchestrationEngine::resume_with_user_input`].

use crate::cloudllm::agent_executor::{AgentExecutor, WorkerRegistry};
use crate::cloudllm::circuit_breaker::CircuitBreaker;
use crate::cloudllm::client_wrapper::ClientWrapper;
use crate::cloudllm::config::EngineConfig;
use crate::cloudllm::event_store::{payloads, EventStore};
use crate::cloudllm::extractors::extract_and_update;
use crate::cloudllm::planner::{AvailableAgent, Planner, PreviousStepSummary};
use crate::cloudllm::qa_handler::{FinalNarrator, QAHandler};
use crate::cloudllm::task_schema::{TaskSchema, TaskSchemaRegistry};
use crate::cloudllm::workflow::{
    AgentError, AgentResult, AgentStatus, ConversationState, GateReason, Step, StepRole,
    StepStatus, Workflow, WorkflowPhase,
};
use crate::cloudllm::workflow_manager::{WorkflowHandle, WorkflowManager};
use crate::cloudllm::workflow_repository::WorkflowRepository;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Owns every orchestration component for one deployment. Cheap to clone —
/// every field is an `Arc` handle or a small value type — so it can be
/// shared across request handlers the way the clients in this crate share a
/// [`ClientWrapper`].
#[derive(Clone)]
pub struct OrchestrationEngine {
    manager: WorkflowManager,
    repository: Arc<dyn WorkflowRepository>,
    events: EventStore,
    breaker: CircuitBreaker,
    planner: Arc<Planner>,
    executor: Arc<AgentExecutor>,
    qa: Arc<QAHandler>,
    narrator: Arc<FinalNarrator>,
    schemas: Arc<TaskSchemaRegistry>,
    completion: Arc<dyn ClientWrapper>,
    agent_call_timeout: std::time::Duration,
}

impl OrchestrationEngine {
    pub fn new(
        completion: Arc<dyn ClientWrapper>,
        workers: WorkerRegistry,
        repository: Arc<dyn WorkflowRepository>,
        schemas: TaskSchemaRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            manager: WorkflowManager::new(),
            repository,
            events: EventStore::new(
                config.event_store_global_capacity,
                config.event_store_per_task_capacity,
            ),
            breaker: CircuitBreaker::new(config.circuit_breaker),
            planner: Arc::new(Planner::new(completion.clone())),
            executor: Arc::new(AgentExecutor::new(workers, completion.clone())),
            qa: Arc::new(QAHandler::new(completion.clone())),
            narrator: Arc::new(FinalNarrator::new(completion.clone())),
            schemas: Arc::new(schemas),
            completion,
            agent_call_timeout: config.agent_call_timeout,
        }
    }

    /// The shared event store, for a fan-out adapter to subscribe to.
    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Creates the workflow, infers its schema, runs the planner, and enters
    /// the execution loop. Returns `None` when the workflow pauses waiting
    /// for user input.
    ///
    /// `cancellation` is checked before each step dispatch and raced against
    /// any in-flight agent call (§5, Scenario F); on cancellation the
    /// workflow transitions to `FAILED` with error code `CANCELLED` and an
    /// error-level log event is emitted. Pass [`CancellationToken::new`] if
    /// the caller has no cancellation source of its own.
    pub async fn process_request(
        &self,
        task_id: &str,
        request: &str,
        available_agents: Vec<AvailableAgent>,
        ext_meta: Option<Value>,
        cancellation: CancellationToken,
    ) -> Option<String> {
        let mut handle = self.manager.lock(task_id).await;
        handle.set(Workflow::new(task_id, request));

        let schema = self.schemas.infer_from_request(request);
        {
            let workflow = handle.get_mut().expect("just set");
            workflow.conversation_state = Some(ConversationState::new());
            workflow.task_schema_type = Some(schema.name.clone());
            workflow.context.insert(
                "available_agents".to_string(),
                serde_json::to_value(&available_agents).unwrap_or(Value::Null),
            );
            if let Some(meta) = ext_meta {
                workflow.context.insert("ext_meta".to_string(), meta);
            }
        }
        self.persist(&handle).await;

        let planner_result = self
            .planner
            .plan(request, &available_agents, None, None)
            .await;

        if !planner_result.success {
            let workflow = handle.get_mut().expect("just set");
            workflow.phase = WorkflowPhase::Failed;
            workflow.touch();
            self.persist(&handle).await;
            return Some(format!(
                "I couldn't figure out how to handle that: {}",
                planner_result.analysis
            ));
        }

        {
            let workflow = handle.get_mut().expect("just set");
            workflow.replace_steps(planner_result.steps);
            workflow.phase = WorkflowPhase::Executing;
            workflow.touch();
        }
        self.persist(&handle).await;

        self.run_execution_loop(&mut handle, task_id, None, cancellation)
            .await
    }

    /// Records `user_input` on the current step, merges it into conversation
    /// state, and re-enters the execution loop. See
    /// [`OrchestrationEngine::process_request`] for `cancellation` semantics.
    pub async fn resume_with_user_input(
        &self,
        task_id: &str,
        user_input: &str,
        cancellation: CancellationToken,
    ) -> Option<String> {
        let mut handle = self.manager.lock(task_id).await;

        if handle.get().is_none() {
            return Some("workflow not found".to_string());
        }

        {
            let workflow = handle.get_mut()?;
            let step = workflow.current_step_mut()?;
            step.user_input = Some(user_input.to_string());
        }

        let mut state = handle
            .get()
            .and_then(|w| w.conversation_state.clone())
            .unwrap_or_default();
        extract_and_update(self.completion.as_ref(), user_input, &mut state).await;

        {
            let workflow = handle.get_mut()?;
            workflow.conversation_state = Some(state);
            workflow.phase = WorkflowPhase::Executing;
            if let Some(step) = workflow.current_step_mut() {
                step.status = StepStatus::Running;
            }
            workflow.touch();
        }
        self.persist(&handle).await;

        self.run_execution_loop(
            &mut handle,
            task_id,
            Some(user_input.to_string()),
            cancellation,
        )
        .await
    }

    async fn persist(&self, handle: &WorkflowHandle) {
        if let Some(workflow) = handle.get() {
            if let Err(err) = self.repository.save(workflow).await {
                log::warn!("failed to persist workflow '{}': {}", workflow.task_id, err);
            }
        }
    }

    fn schema_for(&self, workflow: &Workflow) -> Option<Arc<TaskSchema>> {
        workflow
            .task_schema_type
            .as_deref()
            .and_then(|name| self.schemas.get(name))
    }

    async fn run_execution_loop(
        &self,
        handle: &mut WorkflowHandle,
        task_id: &str,
        mut user_input: Option<String>,
        cancellation: CancellationToken,
    ) -> Option<String> {
        loop {
            if cancellation.is_cancelled() {
                let message = self.apply_cancellation(handle, task_id);
                self.persist(handle).await;
                return Some(message);
            }

            let exhausted = handle.get()?.is_exhausted();
            if exhausted {
                let message = self.finalize(handle, task_id).await;
                return Some(message);
            }

            let already_completed = matches!(
                handle.get()?.current_step().expect("not exhausted").status,
                StepStatus::Completed
            );
            if already_completed {
                handle.get_mut()?.advance();
                self.persist(handle).await;
                continue;
            }

            {
                let workflow = handle.get_mut()?;
                let step = workflow.current_step_mut().expect("not exhausted");
                step.status = StepStatus::Running;
                step.started_at = Some(chrono::Utc::now());
                workflow.touch();
            }

            let workflow_snapshot = handle.get()?.clone();
            let step_snapshot = workflow_snapshot.current_step().expect("not exhausted").clone();
            let (event_type, payload) =
                payloads::agent_status_change(task_id, &step_snapshot.agent_id, "RUNNING");
            self.events.store_event(event_type, payload);
            self.persist(handle).await;

            let result = self
                .dispatch(
                    &workflow_snapshot,
                    &step_snapshot,
                    user_input.take(),
                    &cancellation,
                )
                .await;

            if let Some(error) = &result.error {
                if error.code == "CANCELLED" {
                    let message = self.apply_cancellation(handle, task_id);
                    self.persist(handle).await;
                    return Some(message);
                }
            }

            match result.status {
                AgentStatus::WaitingUser => {
                    self.apply_waiting_user(handle, task_id, &step_snapshot, &result);
                    self.persist(handle).await;
                    return None;
                }
                AgentStatus::Completed => {
                    self.apply_completed(handle, task_id, &step_snapshot, &result);
                    handle.get_mut()?.advance();
                    self.persist(handle).await;
                }
                AgentStatus::Failed => {
                    let reason = result
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown failure".to_string());
                    if self.attempt_replan(handle, task_id, &reason).await {
                        continue;
                    }
                    let workflow = handle.get_mut()?;
                    workflow.phase = WorkflowPhase::Failed;
                    workflow.touch();
                    self.persist(handle).await;
                    return Some(format!(
                        "I ran into a problem I couldn't recover from: {}",
                        reason
                    ));
                }
                AgentStatus::Running | AgentStatus::Idle => {
                    self.persist(handle).await;
                    return None;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        workflow: &Workflow,
        step: &Step,
        user_input: Option<String>,
        cancellation: &CancellationToken,
    ) -> AgentResult {
        if let Err(_open) = self.breaker.before_call(&step.agent_id) {
            return AgentResult::failed(AgentError::new(
                "CIRCUIT_OPEN",
                format!("agent '{}' is temporarily unavailable", step.agent_id),
            ));
        }

        let call = async {
            match step.role {
                StepRole::QAndA => {
                    let schema = self.schema_for(workflow);
                    self.qa
                        .handle(workflow, step, schema.as_deref(), user_input.as_deref())
                        .await
                }
                StepRole::Worker => self.executor.execute(workflow, step, user_input).await,
            }
        };

        let timed_call = tokio::time::timeout(self.agent_call_timeout, call);
        tokio::pin!(timed_call);

        let result = tokio::select! {
            _ = cancellation.cancelled() => AgentResult::failed(AgentError::cancelled()),
            outcome = &mut timed_call => match outcome {
                Ok(result) => result,
                Err(_elapsed) => AgentResult::failed(AgentError::timeout()),
            },
        };

        // A cancellation reflects the caller giving up, not the agent
        // misbehaving; it never feeds the circuit breaker's failure count.
        if result.error.as_ref().map(|e| e.code.as_str()) != Some("CANCELLED") {
            if matches!(result.status, AgentStatus::Failed) {
                self.breaker.record_failure(&step.agent_id);
            } else {
                self.breaker.record_success(&step.agent_id);
            }
        }
        result
    }

    /// Marks the workflow `FAILED` with a `CANCELLED` error and emits an
    /// error-level log event (§5, Scenario F). Does not touch the circuit
    /// breaker.
    fn apply_cancellation(&self, handle: &mut WorkflowHandle, task_id: &str) -> String {
        let error = AgentError::cancelled();
        if let Some(workflow) = handle.get_mut() {
            workflow.phase = WorkflowPhase::Failed;
            workflow.touch();
        }
        let (event_type, payload) = payloads::agent_log(
            "orchestration-engine",
            "Orchestration Engine",
            payloads::LogLevel::Error,
            &format!("task '{}' cancelled: {}", task_id, error.message),
            Some(task_id),
        );
        self.events.store_event(event_type, payload);
        format!("This task was cancelled: {}", error.message)
    }

    fn apply_waiting_user(
        &self,
        handle: &mut WorkflowHandle,
        task_id: &str,
        step_snapshot: &Step,
        result: &AgentResult,
    ) {
        let workflow = match handle.get_mut() {
            Some(w) => w,
            None => return,
        };
        if let Some(step) = workflow.current_step_mut() {
            step.status = StepStatus::WaitingUser;
        }
        workflow.phase = WorkflowPhase::WaitingUser;
        workflow.touch();

        if let Some(message) = &result.message {
            let (event_type, payload) = payloads::task_interaction(
                task_id,
                payloads::InteractionRole::Agent,
                message,
                Some(&step_snapshot.agent_id),
                Some(&step_snapshot.agent_name),
            );
            self.events.store_event(event_type, payload);
        }
    }

    /// Applies a `COMPLETED` [`AgentResult`] to the workflow. Gate
    /// completions (§4.1/§4.6) never surface as a `task_interaction` event.
    fn apply_completed(
        &self,
        handle: &mut WorkflowHandle,
        task_id: &str,
        step_snapshot: &Step,
        result: &AgentResult,
    ) {
        let result_text = result.step_result_text();
        let order = step_snapshot.order;
        let role = step_snapshot.role;

        let workflow = match handle.get_mut() {
            Some(w) => w,
            None => return,
        };
        if let Some(step) = workflow.current_step_mut() {
            step.status = StepStatus::Completed;
            step.completed_at = Some(chrono::Utc::now());
            step.result = result_text.clone();
        }
        if let Some(text) = &result_text {
            workflow
                .context
                .insert(Workflow::context_key_for_step(order), serde_json::json!(text));
        }

        if let Some(reason) = result.gate_reason {
            if reason == GateReason::NeedsWorkerExecution {
                if let Some(worker_id) = result
                    .final_data
                    .as_ref()
                    .and_then(|d| d.get("next_worker_id"))
                    .and_then(Value::as_str)
                {
                    workflow
                        .context
                        .insert("next_worker_id".to_string(), serde_json::json!(worker_id));
                }
            }
            if let Some(state) = workflow.conversation_state.as_mut() {
                state.set_flag("needs_worker_execution", reason == GateReason::NeedsWorkerExecution);
            }
            // Gates are invisible to the user: no interaction event.
        } else if matches!(role, StepRole::QAndA) {
            if let Some(text) = result_text.as_deref().filter(|t| !t.is_empty()) {
                let (event_type, payload) = payloads::task_interaction(
                    task_id,
                    payloads::InteractionRole::Agent,
                    text,
                    Some(&step_snapshot.agent_id),
                    Some(&step_snapshot.agent_name),
                );
                self.events.store_event(event_type, payload);
            }
        }
        workflow.touch();
    }

    /// §4.12: capture the current plan, ask the planner for a replacement,
    /// and swap it in on success. Returns whether the replan succeeded.
    async fn attempt_replan(&self, handle: &mut WorkflowHandle, task_id: &str, reason: &str) -> bool {
        let (request, available_agents, previous) = {
            let workflow = match handle.get() {
                Some(w) => w,
                None => return false,
            };
            let previous: Vec<PreviousStepSummary> = workflow
                .steps
                .iter()
                .map(|s| PreviousStepSummary {
                    id: s.id.clone(),
                    description: s.description.clone(),
                    status: s.status,
                })
                .collect();
            let agents: Vec<AvailableAgent> = workflow
                .context
                .get("available_agents")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            (workflow.original_request.clone(), agents, previous)
        };

        let replan_reason = format!("replan: {}", reason);
        let planner_result = self
            .planner
            .plan(&request, &available_agents, Some(&previous), Some(&replan_reason))
            .await;

        if !planner_result.success {
            return false;
        }

        if let Some(workflow) = handle.get_mut() {
            workflow.replace_steps(planner_result.steps);
            workflow.touch();
        }
        let (event_type, payload) = payloads::agent_log(
            "orchestration-engine",
            "Orchestration Engine",
            payloads::LogLevel::Decision,
            &format!("replanned task '{}': {}", task_id, reason),
            Some(task_id),
        );
        self.events.store_event(event_type, payload);
        self.persist(handle).await;
        true
    }

    /// §4.1 finalization: narrate the completed work and close the workflow.
    async fn finalize(&self, handle: &mut WorkflowHandle, task_id: &str) -> String {
        let (original_request, completed_worker_results, facts) = {
            let workflow = handle.get().expect("workflow exists");
            let results: Vec<(String, String)> = workflow
                .steps
                .iter()
                .filter(|s| matches!(s.role, StepRole::Worker) && matches!(s.status, StepStatus::Completed))
                .filter_map(|s| s.result.clone().map(|r| (s.agent_name.clone(), r)))
                .collect();
            let facts = workflow
                .conversation_state
                .as_ref()
                .map(|s| s.facts.clone())
                .unwrap_or_default();
            (workflow.original_request.clone(), results, facts)
        };

        if let Some(workflow) = handle.get_mut() {
            workflow.phase = WorkflowPhase::Finalizing;
            workflow.touch();
        }
        self.persist(handle).await;

        let message = self
            .narrator
            .generate(&original_request, &completed_worker_results, &facts)
            .await;

        let (event_type, payload) = payloads::task_interaction(
            task_id,
            payloads::InteractionRole::Agent,
            &message,
            None,
            None,
        );
        self.events.store_event(event_type, payload);

        if let Some(workflow) = handle.get_mut() {
            workflow.phase = WorkflowPhase::Completed;
            workflow.touch();
        }
        self.persist(handle).await;

        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{Message, Role};
    use crate::cloudllm::workflow_repository::InMemoryWorkflowRepository;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A scripted completion: returns planner/Q&A/narrator JSON in order,
    /// cycling back to the last reply once exhausted.
    struct ScriptedCompletion {
        replies: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientWrapper for ScriptedCompletion {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::cloudllm::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
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

    fn agent() -> AvailableAgent {
        AvailableAgent {
            id: "greeter".to_string(),
            name: "Greeter".to_string(),
            agent_type: "qa".to_string(),
            description: "greets the user".to_string(),
        }
    }

    #[tokio::test]
    async fn single_qa_step_pauses_for_user_input() {
        let plan = r#"{"analysis": "say hi", "steps": [
            {"agent_id": "greeter", "agent_name": "Greeter", "role": "q_and_a",
             "description": "greet and ask for a name", "user_prompt": "What's your name?"}
        ]}"#;
        let completion = Arc::new(ScriptedCompletion {
            replies: vec![plan.to_string()],
            calls: AtomicUsize::new(0),
        });
        let engine = OrchestrationEngine::new(
            completion,
            WorkerRegistry::new(),
            Arc::new(InMemoryWorkflowRepository::new()),
            TaskSchemaRegistry::new(),
            EngineConfig::default(),
        );

        let outcome = engine
            .process_request("t1", "say hi", vec![agent()], None, CancellationToken::new())
            .await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn resume_drives_qa_step_to_completion() {
        let plan = r#"{"analysis": "say hi", "steps": [
            {"agent_id": "greeter", "agent_name": "Greeter", "role": "q_and_a",
             "description": "greet and ask for a name", "user_prompt": "What's your name?"}
        ]}"#;
        let qa_completed = r#"{"status": "COMPLETED", "message": ""}"#;
        let narration = "Nice to meet you!";
        let completion = Arc::new(ScriptedCompletion {
            replies: vec![plan.to_string(), qa_completed.to_string(), narration.to_string()],
            calls: AtomicUsize::new(0),
        });
        let engine = OrchestrationEngine::new(
            completion,
            WorkerRegistry::new(),
            Arc::new(InMemoryWorkflowRepository::new()),
            TaskSchemaRegistry::new(),
            EngineConfig::default(),
        );

        let first = engine
            .process_request("t2", "say hi", vec![agent()], None, CancellationToken::new())
            .await;
        assert!(first.is_none());

        let second = engine
            .resume_with_user_input("t2", "Ada", CancellationToken::new())
            .await;
        assert_eq!(second.as_deref(), Some(narration));
    }

    #[tokio::test]
    async fn resuming_an_unknown_task_reports_not_found() {
        let engine = OrchestrationEngine::new(
            Arc::new(ScriptedCompletion {
                replies: vec![],
                calls: AtomicUsize::new(0),
            }),
            WorkerRegistry::new(),
            Arc::new(InMemoryWorkflowRepository::new()),
            TaskSchemaRegistry::new(),
            EngineConfig::default(),
        );

        let reply = engine
            .resume_with_user_input("does-not-exist", "hello", CancellationToken::new())
            .await;
        assert_eq!(reply.as_deref(), Some("workflow not found"));
    }

    #[tokio::test]
    async fn cancelling_before_dispatch_fails_the_workflow() {
        let plan = r#"{"analysis": "say hi", "steps": [
            {"agent_id": "greeter", "agent_name": "Greeter", "role": "q_and_a",
             "description": "greet and ask for a name", "user_prompt": "What's your name?"}
        ]}"#;
        let completion = Arc::new(ScriptedCompletion {
            replies: vec![plan.to_string()],
            calls: AtomicUsize::new(0),
        });
        let engine = OrchestrationEngine::new(
            completion,
            WorkerRegistry::new(),
            Arc::new(InMemoryWorkflowRepository::new()),
            TaskSchemaRegistry::new(),
            EngineConfig::default(),
        );

        let token = CancellationToken::new();
        token.cancel();

        let outcome = engine
            .process_request("t3", "say hi", vec![agent()], None, token)
            .await;
        assert!(outcome.unwrap().contains("cancelled"));
    }
}
