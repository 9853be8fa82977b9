//! Core data model for the orchestration engine: [`Workflow`], [`Step`], and the
//! [`AgentResult`] contract every agent (worker or Q&A) returns.
//!
//! These are plain structs with explicit fields — there is no dynamic
//! dictionary anywhere in the model. The one deliberately "loose" piece is
//! [`Workflow::context`], a `HashMap<String, Value>` bag used to stash
//! cross-step data (e.g. a prior step's result) that downstream steps read
//! back by a conventional key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle phase of a [`Workflow`].
///
/// ```text
/// ANALYZING → EXECUTING → {WAITING_USER ↔ EXECUTING} → FINALIZING → COMPLETED
/// ANALYZING → FAILED
/// EXECUTING → FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    Analyzing,
    Executing,
    WaitingUser,
    Finalizing,
    Completed,
    Failed,
}

/// Which kind of agent a [`Step`] dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRole {
    Worker,
    QAndA,
}

impl StepRole {
    /// Normalize a planner-supplied role token onto the two canonical roles.
    ///
    /// The planner output boundary is the only place that ever sees the raw
    /// strings `"worker"`, `"q_and_a"`, `"question"`, or `"answer"` — every
    /// other component works exclusively with [`StepRole`].
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "worker" => Some(StepRole::Worker),
            "q_and_a" | "question" | "answer" | "qanda" | "q&a" => Some(StepRole::QAndA),
            _ => None,
        }
    }
}

/// Execution status of a single [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingUser,
    Completed,
    Failed,
}

/// One unit of a workflow plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub role: StepRole,
    pub description: String,
    /// 1-based, monotonically increasing within a plan.
    pub order: u32,
    pub status: StepStatus,
    pub result: Option<String>,
    pub data: Option<Value>,
    pub user_input: Option<String>,
    /// Initial question text, meaningful only for [`StepRole::QAndA`] steps.
    pub user_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        role: StepRole,
        description: impl Into<String>,
        order: u32,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            role,
            description: description.into(),
            order,
            status: StepStatus::Pending,
            result: None,
            data: None,
            user_input: None,
            user_prompt: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.user_prompt = Some(prompt.into());
        self
    }
}

/// The reason a Q_AND_A step completed without ever speaking to the user.
///
/// Centralizing this as an enum (rather than matching on free-form strings
/// embedded in `finalData`) keeps the "gate invisibility" rule in §4.1/§4.6
/// enforceable at the type level: any [`AgentResult`] whose `gate_reason` is
/// `Some` must never be turned into a `task_interaction` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    RequiredSlotsFilled,
    SchemaComplete,
    NeedsWorkerExecution,
}

/// How a client should render a [`AgentResult::input_schema`] prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSchema {
    FreeText {
        placeholder: Option<String>,
    },
    SingleSelect {
        choices: Vec<String>,
        placeholder: Option<String>,
    },
    MultiSelect {
        choices: Vec<String>,
        placeholder: Option<String>,
    },
}

/// Status an [`AgentResult`] can carry; mirrors [`StepStatus`] plus `Idle`
/// for an agent that has not yet been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Running,
    WaitingUser,
    Completed,
    Failed,
}

/// A structured error surfaced by an agent. Agents never panic or throw
/// across the agent boundary — a failure is always an `AgentResult` whose
/// `status` is [`AgentStatus::Failed`] and whose `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentError {
    pub code: String,
    pub message: String,
}

impl AgentError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new("TIMEOUT", "the agent call timed out")
    }

    pub fn cancelled() -> Self {
        Self::new("CANCELLED", "the operation was cancelled")
    }
}

/// The contract returned by every worker and Q&A agent.
///
/// Invariant: when `status` is not `Running`, exactly one of
/// `partial_data`, `final_data`, `error` is populated. `input_schema` is
/// meaningful only when `status == WaitingUser`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub message: Option<String>,
    pub required_inputs: Vec<String>,
    pub input_schema: Option<InputSchema>,
    pub partial_data: Option<Value>,
    pub final_data: Option<Value>,
    /// Set only for gate completions — see [`GateReason`].
    pub gate_reason: Option<GateReason>,
    pub error: Option<AgentError>,
}

impl AgentResult {
    pub fn waiting_user(message: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::WaitingUser,
            message: Some(message.into()),
            required_inputs: Vec::new(),
            input_schema: None,
            partial_data: None,
            final_data: None,
            gate_reason: None,
            error: None,
        }
    }

    pub fn waiting_user_with_schema(message: impl Into<String>, schema: InputSchema) -> Self {
        let mut r = Self::waiting_user(message);
        r.input_schema = Some(schema);
        r
    }

    pub fn completed(final_data: Value) -> Self {
        Self {
            status: AgentStatus::Completed,
            message: None,
            required_inputs: Vec::new(),
            input_schema: None,
            partial_data: None,
            final_data: Some(final_data),
            gate_reason: None,
            error: None,
        }
    }

    /// A gate completion: the schema already has what it needs, so this
    /// result must never surface as a `task_interaction` event.
    pub fn gate(reason: GateReason) -> Self {
        Self {
            status: AgentStatus::Completed,
            message: None,
            required_inputs: Vec::new(),
            input_schema: None,
            partial_data: None,
            final_data: Some(serde_json::json!({ "reason": reason })),
            gate_reason: Some(reason),
            error: None,
        }
    }

    pub fn failed(error: AgentError) -> Self {
        Self {
            status: AgentStatus::Failed,
            message: Some(error.message.clone()),
            required_inputs: Vec::new(),
            input_schema: None,
            partial_data: None,
            final_data: None,
            gate_reason: None,
            error: Some(error),
        }
    }

    /// Is this a gate completion, per §4.1/§4.6 ("gates are invisible to the user")?
    pub fn is_gate(&self) -> bool {
        self.gate_reason.is_some()
    }

    /// The text to persist as `Step::result` on completion: `finalData.output`
    /// if present, else the free-form `message`.
    pub fn step_result_text(&self) -> Option<String> {
        if let Some(data) = &self.final_data {
            if let Some(output) = data.get("output").and_then(Value::as_str) {
                return Some(output.to_string());
            }
        }
        self.message.clone()
    }
}

/// Domain-neutral container of everything extracted from the user so far.
///
/// `facts` are objective values the user supplied ("downtown"); `decisions`
/// are choices among options ("proceed"). A key counts as *present* only
/// when its value is non-null — `serde_json::Value::Null` is treated the
/// same as absent everywhere in this module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub facts: HashMap<String, Value>,
    pub decisions: HashMap<String, Value>,
    pub flags: HashMap<String, bool>,
    pub metadata: HashMap<String, Value>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is `key` present with a non-null value in `facts`?
    pub fn has_fact(&self, key: &str) -> bool {
        matches!(self.facts.get(key), Some(v) if !v.is_null())
    }

    pub fn has_decision(&self, key: &str) -> bool {
        matches!(self.decisions.get(key), Some(v) if !v.is_null())
    }

    pub fn set_flag(&mut self, key: impl Into<String>, value: bool) {
        self.flags.insert(key.into(), value);
    }

    pub fn flag(&self, key: &str) -> bool {
        self.flags.get(key).copied().unwrap_or(false)
    }
}

/// A complete, owned record of one task's orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub task_id: String,
    pub original_request: String,
    pub phase: WorkflowPhase,
    pub steps: Vec<Step>,
    pub current_step_index: usize,
    pub context: HashMap<String, Value>,
    pub conversation_state: Option<ConversationState>,
    pub task_schema_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(task_id: impl Into<String>, original_request: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            original_request: original_request.into(),
            phase: WorkflowPhase::Analyzing,
            steps: Vec::new(),
            current_step_index: 0,
            context: HashMap::new(),
            conversation_state: None,
            task_schema_type: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The step currently being (or about to be) executed, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step_index)
    }

    /// Has every step in the plan been exhausted?
    pub fn is_exhausted(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    pub fn advance(&mut self) {
        self.current_step_index = (self.current_step_index + 1).min(self.steps.len());
        self.touch();
    }

    /// Replace the remaining step list wholesale (§4.12 Replan) and reset
    /// `current_step_index` to zero. The conversation state is left intact.
    pub fn replace_steps(&mut self, steps: Vec<Step>) {
        self.steps = steps;
        self.current_step_index = 0;
        self.touch();
    }

    pub fn context_key_for_step(order: u32) -> String {
        format!("step_{}_result", order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_role_normalizes_aliases() {
        assert_eq!(StepRole::normalize("worker"), Some(StepRole::Worker));
        assert_eq!(StepRole::normalize("q_and_a"), Some(StepRole::QAndA));
        assert_eq!(StepRole::normalize("question"), Some(StepRole::QAndA));
        assert_eq!(StepRole::normalize("answer"), Some(StepRole::QAndA));
        assert_eq!(StepRole::normalize("bogus"), None);
    }

    #[test]
    fn conversation_state_null_is_absent() {
        let mut state = ConversationState::new();
        assert!(!state.has_fact("location"));
        state.facts.insert("location".to_string(), Value::Null);
        assert!(!state.has_fact("location"));
        state.facts.insert("location".to_string(), serde_json::json!("downtown"));
        assert!(state.has_fact("location"));
    }

    #[test]
    fn gate_results_are_marked_invisible() {
        let r = AgentResult::gate(GateReason::SchemaComplete);
        assert!(r.is_gate());
        let r2 = AgentResult::waiting_user("What time?");
        assert!(!r2.is_gate());
    }

    #[test]
    fn workflow_advance_is_monotonic_until_replan() {
        let mut wf = Workflow::new("t1", "book a table");
        wf.replace_steps(vec![
            Step::new("s1", "a1", "Agent One", StepRole::Worker, "do thing", 1),
            Step::new("s2", "a2", "Agent Two", StepRole::QAndA, "confirm", 2),
        ]);
        assert_eq!(wf.current_step_index, 0);
        wf.advance();
        assert_eq!(wf.current_step_index, 1);
        wf.advance();
        assert!(wf.is_exhausted());
        wf.replace_steps(vec![Step::new("s3", "a3", "Agent Three", StepRole::Worker, "retry", 1)]);
        assert_eq!(wf.current_step_index, 0);
    }
}
