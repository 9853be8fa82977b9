//! §4.5 Extractors — turns a user's free-form utterance into updates to a
//! [`ConversationState`], using the LLM with a strict output schema and a
//! pattern-matching fallback when the LLM call fails or returns unparsable
//! JSON.
//!
//! Correction semantics (resolving the open question in spec §9/§4.5): the
//! LLM output schema has two distinct objects, `facts`/`decisions` (fill
//! gaps only) and `corrections` (explicitly allowed to overwrite an existing
//! non-nil fact). The pattern fallback never corrects, which trivially
//! satisfies "no fact loss on extraction" (§8 invariant 3) since it can only
//! ever add keys that were previously absent.

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role};
use crate::cloudllm::workflow::ConversationState;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
struct ExtractionOutput {
    #[serde(default)]
    facts: std::collections::HashMap<String, Value>,
    #[serde(default)]
    decisions: std::collections::HashMap<String, Value>,
    #[serde(default)]
    corrections: std::collections::HashMap<String, Value>,
}

/// Merge a user utterance into `state`, mutating it in place.
///
/// Never overwrites an existing non-nil fact except through the
/// `corrections` channel; decisions may always be overwritten by the most
/// recent utterance (they represent the user's current choice, not an
/// immutable observation).
pub async fn extract_and_update(
    completion: &dyn ClientWrapper,
    user_input: &str,
    state: &mut ConversationState,
) {
    let output = match run_llm_extraction(completion, user_input, state).await {
        Some(output) => output,
        None => pattern_fallback(user_input),
    };

    for (key, value) in output.facts {
        if value.is_null() {
            continue;
        }
        if !state.has_fact(&key) {
            state.facts.insert(key, value);
        }
    }
    for (key, value) in output.corrections {
        if value.is_null() {
            continue;
        }
        state.facts.insert(key, value);
    }
    for (key, value) in output.decisions {
        if value.is_null() {
            continue;
        }
        state.decisions.insert(key, value);
    }
}

async fn run_llm_extraction(
    completion: &dyn ClientWrapper,
    user_input: &str,
    state: &ConversationState,
) -> Option<ExtractionOutput> {
    let prompt = build_extraction_prompt(user_input, state);
    let response = completion
        .send_message(
            &[Message {
                role: Role::User,
                content: Arc::from(prompt.as_str()),
                tool_calls: vec![],
            }],
            None,
        )
        .await
        .ok()?;
    parse_extraction_json(&response.content)
}

fn build_extraction_prompt(user_input: &str, state: &ConversationState) -> String {
    format!(
        "You extract structured facts and decisions from a user message.\n\
         Known facts so far: {}\n\
         Known decisions so far: {}\n\
         User message: \"{}\"\n\n\
         Respond with JSON only, matching exactly:\n\
         {{\"facts\": {{...}}, \"decisions\": {{...}}, \"corrections\": {{...}}}}\n\
         Put a key in \"facts\" only if it is new information not already known.\n\
         Put a key in \"corrections\" only if the user is explicitly changing a \
         previously stated fact.\n\
         Put a key in \"decisions\" for any explicit choice the user is making now.",
        serde_json::to_string(&state.facts).unwrap_or_default(),
        serde_json::to_string(&state.decisions).unwrap_or_default(),
        user_input.replace('"', "'"),
    )
}

fn parse_extraction_json(raw: &str) -> Option<ExtractionOutput> {
    let trimmed = raw.trim();
    let json_start = trimmed.find('{')?;
    let json_end = trimmed.rfind('}')?;
    if json_end < json_start {
        return None;
    }
    serde_json::from_str(&trimmed[json_start..=json_end]).ok()
}

/// Best-effort extraction used when the LLM call itself fails. Only ever
/// fills a single conventional slot (`raw_input`) as a fact, so it can never
/// violate the no-fact-loss invariant and never corrects anything.
fn pattern_fallback(user_input: &str) -> ExtractionOutput {
    let mut facts = std::collections::HashMap::new();
    facts.insert("raw_input".to_string(), Value::String(user_input.to_string()));
    ExtractionOutput {
        facts,
        decisions: std::collections::HashMap::new(),
        corrections: std::collections::HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_json_possibly_wrapped_in_prose() {
        let raw = "Sure, here you go:\n{\"facts\": {\"location\": \"downtown\"}, \"decisions\": {}, \"corrections\": {}}\nHope that helps.";
        let parsed = parse_extraction_json(raw).unwrap();
        assert_eq!(parsed.facts.get("location").unwrap(), "downtown");
    }

    #[test]
    fn unparsable_json_returns_none() {
        assert!(parse_extraction_json("not json at all").is_none());
    }

    #[test]
    fn fallback_never_loses_or_corrects_facts() {
        let output = pattern_fallback("7pm tomorrow");
        assert!(output.corrections.is_empty());
        assert_eq!(output.facts.len(), 1);
    }
}
