//! §4.6 Q&A Handler and Final Narrator.
//!
//! The Q&A handler produces the single next user-facing utterance, or
//! completes the step invisibly when the governing [`TaskSchema`] says the
//! gate is already satisfied. The Final Narrator is a thin sibling used only
//! by finalization (§4.1) to produce the one closing message for a
//! completed workflow.

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role};
use crate::cloudllm::task_schema::{NextAction, TaskSchema};
use crate::cloudllm::workflow::{AgentResult, AgentStatus, ConversationState, GateReason, Step, Workflow};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub struct QAHandler {
    completion: Arc<dyn ClientWrapper>,
}

impl QAHandler {
    pub fn new(completion: Arc<dyn ClientWrapper>) -> Self {
        Self { completion }
    }

    /// §4.6 algorithm. `schema` governs gating when both a conversation
    /// state and schema are available; without either, every turn falls
    /// through to LLM generation.
    pub async fn handle(
        &self,
        workflow: &Workflow,
        step: &Step,
        schema: Option<&TaskSchema>,
        user_input: Option<&str>,
    ) -> AgentResult {
        // Step 2: initial turn — the step carries its own opening question.
        if let Some(prompt) = &step.user_prompt {
            if user_input.is_none() {
                let message = self.prepend_worker_summary(workflow, prompt);
                return AgentResult::waiting_user(message);
            }
        }

        // Step 3: schema gate, only when we actually have state to gate on.
        if let (Some(input), Some(state), Some(schema)) =
            (user_input, workflow.conversation_state.as_ref(), schema)
        {
            match schema.next_action(state) {
                NextAction::Complete => return AgentResult::gate(GateReason::SchemaComplete),
                NextAction::Execute { worker_id } => {
                    return self.execute_gate(worker_id);
                }
                NextAction::Ask => {
                    return self.generate(workflow, step, Some(input)).await;
                }
            }
        }

        // No schema/state to gate on (or no user input yet but also no
        // user_prompt on the step): fall through to LLM generation.
        self.generate(workflow, step, user_input).await
    }

    fn execute_gate(&self, worker_id: String) -> AgentResult {
        let mut result = AgentResult::gate(GateReason::NeedsWorkerExecution);
        result.final_data = Some(serde_json::json!({
            "reason": GateReason::NeedsWorkerExecution,
            "next_worker_id": worker_id,
        }));
        result
    }

    fn prepend_worker_summary(&self, workflow: &Workflow, prompt: &str) -> String {
        let worker_summary = completed_worker_summary(workflow);
        if worker_summary.is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{}", worker_summary, prompt)
        }
    }

    async fn generate(&self, workflow: &Workflow, step: &Step, user_input: Option<&str>) -> AgentResult {
        let prompt = build_qa_prompt(workflow, step, user_input);
        let response = self
            .completion
            .send_message(
                &[Message {
                    role: Role::User,
                    content: Arc::from(prompt.as_str()),
                    tool_calls: vec![],
                }],
                None,
            )
            .await;

        let raw = match response {
            Ok(message) => message.content.to_string(),
            Err(_) => {
                return AgentResult::waiting_user(
                    "I ran into trouble reaching the assistant — could you repeat that?",
                )
            }
        };

        match parse_qa_json(&raw) {
            Some(parsed) if parsed.status.eq_ignore_ascii_case("completed") => {
                AgentResult::completed(serde_json::json!({ "output": parsed.message }))
            }
            Some(parsed) => AgentResult::waiting_user(parsed.message),
            // §7.4: parse failure recovers by returning WAITING_USER with the raw text.
            None => AgentResult::waiting_user(raw),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QAOutput {
    status: String,
    message: String,
}

fn parse_qa_json(raw: &str) -> Option<QAOutput> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn completed_worker_summary(workflow: &Workflow) -> String {
    workflow
        .steps
        .iter()
        .filter(|s| {
            matches!(s.role, crate::cloudllm::workflow::StepRole::Worker)
                && matches!(s.status, crate::cloudllm::workflow::StepStatus::Completed)
        })
        .filter_map(|s| s.result.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_qa_prompt(workflow: &Workflow, step: &Step, user_input: Option<&str>) -> String {
    let known_facts = workflow
        .conversation_state
        .as_ref()
        .map(|s| serde_json::to_string(&s.facts).unwrap_or_default())
        .unwrap_or_else(|| "{}".to_string());

    let mut prompt = format!(
        "You are the question-and-answer agent for this task.\n\
         Original request: {}\n\
         Step description: {}\n\
         Already-known facts (never restate these): {}\n",
        workflow.original_request, step.description, known_facts
    );
    if let Some(input) = user_input {
        prompt.push_str(&format!("User just said: \"{}\"\n", input.replace('"', "'")));
    }
    prompt.push_str(
        "Respond with JSON only: {\"status\": \"WAITING_USER\"|\"COMPLETED\", \"message\": \"...\"}\n\
         Ask exactly one actionable question if status is WAITING_USER. \
         Never name internal agents or mechanics.",
    );
    prompt
}

/// §4.1 finalization: produces the single closing message for a completed
/// workflow from the completed worker results and confirmed facts.
pub struct FinalNarrator {
    completion: Arc<dyn ClientWrapper>,
}

impl FinalNarrator {
    pub fn new(completion: Arc<dyn ClientWrapper>) -> Self {
        Self { completion }
    }

    pub async fn generate(
        &self,
        original_request: &str,
        completed_worker_results: &[(String, String)],
        facts: &std::collections::HashMap<String, Value>,
    ) -> String {
        let prompt = build_narrator_prompt(original_request, completed_worker_results, facts);
        let response = self
            .completion
            .send_message(
                &[Message {
                    role: Role::User,
                    content: Arc::from(prompt.as_str()),
                    tool_calls: vec![],
                }],
                None,
            )
            .await;

        match response {
            Ok(message) if !message.content.trim().is_empty() => message.content.to_string(),
            _ => fallback_summary(completed_worker_results),
        }
    }
}

fn build_narrator_prompt(
    original_request: &str,
    completed_worker_results: &[(String, String)],
    facts: &std::collections::HashMap<String, Value>,
) -> String {
    let mut prompt = format!(
        "Write one short, natural closing message for the user.\n\
         Original request: {}\n",
        original_request
    );
    if !completed_worker_results.is_empty() {
        prompt.push_str("Completed work:\n");
        for (agent, result) in completed_worker_results {
            prompt.push_str(&format!("- {}: {}\n", agent, result));
        }
    }
    if !facts.is_empty() {
        prompt.push_str(&format!(
            "Confirmed details: {}\n",
            serde_json::to_string(facts).unwrap_or_default()
        ));
    }
    prompt.push_str("Respond with the message only, no preamble, no agent names.");
    prompt
}

fn fallback_summary(completed_worker_results: &[(String, String)]) -> String {
    if completed_worker_results.is_empty() {
        return "All done!".to_string();
    }
    completed_worker_results
        .iter()
        .map(|(_, result)| result.clone())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qa_json_parses_inner_object() {
        let raw = "{\"status\": \"WAITING_USER\", \"message\": \"What time works?\"}";
        let parsed = parse_qa_json(raw).unwrap();
        assert_eq!(parsed.status, "WAITING_USER");
        assert_eq!(parsed.message, "What time works?");
    }

    #[test]
    fn qa_json_parse_failure_returns_none() {
        assert!(parse_qa_json("garbled response").is_none());
    }

    #[test]
    fn fallback_summary_never_empty() {
        assert_eq!(fallback_summary(&[]), "All done!");
        let results = vec![("search".to_string(), "Found option A".to_string())];
        assert_eq!(fallback_summary(&results), "Found option A");
    }
}
