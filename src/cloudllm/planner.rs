//! §4.3 Planner — turns a request (plus the set of available agents) into
//! an ordered list of [`Step`]s, or a replan of the remaining steps after a
//! failure.

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role};
use crate::cloudllm::workflow::{Step, StepRole, StepStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One agent the planner may assign a step to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableAgent {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub description: String,
}

/// A prior step's id/description/status, supplied to the planner when
/// producing a replan so it can avoid reissuing completed work.
#[derive(Debug, Clone)]
pub struct PreviousStepSummary {
    pub id: String,
    pub description: String,
    pub status: StepStatus,
}

pub struct PlannerResult {
    pub success: bool,
    pub steps: Vec<Step>,
    pub analysis: String,
}

impl PlannerResult {
    fn failure(analysis: impl Into<String>) -> Self {
        Self {
            success: false,
            steps: Vec::new(),
            analysis: analysis.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPlannerStep {
    agent_id: String,
    agent_name: String,
    role: String,
    description: String,
    #[serde(default)]
    user_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlannerOutput {
    #[serde(default)]
    analysis: String,
    steps: Vec<RawPlannerStep>,
}

/// Produces an ordered plan from a request, or a replan of the remaining
/// steps after a failure (§4.12).
pub struct Planner {
    completion: Arc<dyn ClientWrapper>,
}

impl Planner {
    pub fn new(completion: Arc<dyn ClientWrapper>) -> Self {
        Self { completion }
    }

    /// `previous_plan`/`reason` are both `Some` only when this call is a
    /// replan; the engine passes a reason prefixed `"replan: "`.
    pub async fn plan(
        &self,
        request: &str,
        available_agents: &[AvailableAgent],
        previous_plan: Option<&[PreviousStepSummary]>,
        reason: Option<&str>,
    ) -> PlannerResult {
        if available_agents.is_empty() {
            return PlannerResult::failure("cannot analyze: no agents are available");
        }

        let prompt = build_planner_prompt(request, available_agents, previous_plan, reason);
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
            Err(_) => return PlannerResult::failure("cannot analyze: planner call failed"),
        };

        match parse_planner_output(&raw) {
            Some(output) if !output.steps.is_empty() => PlannerResult {
                success: true,
                steps: output.steps,
                analysis: output.analysis,
            },
            Some(_) => PlannerResult::failure("cannot analyze: planner returned zero steps"),
            None => PlannerResult::failure("cannot analyze: planner output was unparsable"),
        }
    }
}

struct ParsedOutput {
    analysis: String,
    steps: Vec<Step>,
}

fn parse_planner_output(raw: &str) -> Option<ParsedOutput> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: RawPlannerOutput = serde_json::from_str(&trimmed[start..=end]).ok()?;

    let mut steps = Vec::with_capacity(parsed.steps.len());
    for (index, raw_step) in parsed.steps.into_iter().enumerate() {
        // Role normalization happens exactly once, here, at the planner
        // output boundary (§9 resolved open question).
        let role = StepRole::normalize(&raw_step.role)?;
        let mut step = Step::new(
            Uuid::new_v4().to_string(),
            raw_step.agent_id,
            raw_step.agent_name,
            role,
            raw_step.description,
            (index + 1) as u32,
        );
        if let Some(prompt) = raw_step.user_prompt {
            step = step.with_user_prompt(prompt);
        }
        steps.push(step);
    }

    Some(ParsedOutput {
        analysis: parsed.analysis,
        steps,
    })
}

fn build_planner_prompt(
    request: &str,
    available_agents: &[AvailableAgent],
    previous_plan: Option<&[PreviousStepSummary]>,
    reason: Option<&str>,
) -> String {
    let mut prompt = String::from(
        "You are the planning agent for a multi-agent orchestration system.\n\
         Produce an ordered list of steps to satisfy the user's request.\n\n\
         Rules:\n\
         1. Worker agents never speak to the user; any user-facing prompt must be a q_and_a step.\n\
         2. A worker result needing user confirmation must be followed by a q_and_a step whose \
            user_prompt explains the choice.\n\
         3. The last step of the plan must be a q_and_a finalization step.\n\n",
    );

    prompt.push_str("Available agents:\n");
    for agent in available_agents {
        prompt.push_str(&format!(
            "- id={} name={} type={} description={}\n",
            agent.id, agent.name, agent.agent_type, agent.description
        ));
    }

    prompt.push_str(&format!("\nUser request: {}\n", request));

    if let (Some(previous), Some(reason)) = (previous_plan, reason) {
        prompt.push_str(&format!("\nThis is a replan. Reason: {}\n", reason));
        prompt.push_str("Previous plan (do not reissue completed steps):\n");
        for step in previous {
            prompt.push_str(&format!(
                "- id={} status={:?} description={}\n",
                step.id, step.status, step.description
            ));
        }
    }

    prompt.push_str(
        "\nRespond with JSON only, matching exactly:\n\
         {\"analysis\": \"...\", \"steps\": [{\"agent_id\": \"...\", \"agent_name\": \"...\", \
         \"role\": \"worker\"|\"q_and_a\", \"description\": \"...\", \"user_prompt\": \"...\"?}]}",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_plan() {
        let raw = r#"{"analysis": "simple greeting", "steps": [
            {"agent_id": "qa", "agent_name": "Greeter", "role": "q_and_a", "description": "greet", "user_prompt": "How can I help?"}
        ]}"#;
        let parsed = parse_planner_output(raw).unwrap();
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.steps[0].role, StepRole::QAndA);
        assert_eq!(parsed.steps[0].order, 1);
    }

    #[test]
    fn aliased_roles_normalize() {
        let raw = r#"{"analysis": "x", "steps": [
            {"agent_id": "a", "agent_name": "A", "role": "question", "description": "ask"}
        ]}"#;
        let parsed = parse_planner_output(raw).unwrap();
        assert_eq!(parsed.steps[0].role, StepRole::QAndA);
    }

    #[test]
    fn unknown_role_fails_the_whole_parse() {
        let raw = r#"{"analysis": "x", "steps": [
            {"agent_id": "a", "agent_name": "A", "role": "bogus", "description": "ask"}
        ]}"#;
        assert!(parse_planner_output(raw).is_none());
    }
}
