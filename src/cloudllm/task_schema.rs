//! Domain-neutral gating rules: [`TaskSchema`] decides, from a
//! [`ConversationState`] alone, whether the workflow should keep asking,
//! dispatch a worker, or declare itself complete.
//!
//! A schema's [`TaskSchema::next_action`] is a pure function — no I/O, no
//! LLM call — which is exactly what lets the [`crate::cloudllm::qa_handler::QAHandler`]
//! gate a turn without a network round trip.

use crate::cloudllm::workflow::ConversationState;
use std::collections::HashMap;
use std::sync::Arc;

/// What the engine should do next, as decided by a schema's gating rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Ask,
    Execute { worker_id: String },
    Complete,
}

/// A named rule set describing which facts/decisions a task needs and which
/// worker (if any) must run before the task can complete.
pub struct TaskSchema {
    pub name: String,
    pub required_facts: Vec<String>,
    pub required_decisions: Vec<String>,
    /// Worker to dispatch once all required facts/decisions are present, if
    /// it has not already run. `None` means no worker step is required.
    pub required_worker: Option<String>,
}

impl TaskSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_facts: Vec::new(),
            required_decisions: Vec::new(),
            required_worker: None,
        }
    }

    pub fn with_required_facts(mut self, facts: Vec<String>) -> Self {
        self.required_facts = facts;
        self
    }

    pub fn with_required_decisions(mut self, decisions: Vec<String>) -> Self {
        self.required_decisions = decisions;
        self
    }

    pub fn with_required_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.required_worker = Some(worker_id.into());
        self
    }

    /// §4.4: missing fact → Ask; else missing decision → Ask; else a required
    /// worker that has not run yet → Execute; else Complete.
    pub fn next_action(&self, state: &ConversationState) -> NextAction {
        for key in &self.required_facts {
            if !state.has_fact(key) {
                return NextAction::Ask;
            }
        }
        for key in &self.required_decisions {
            if !state.has_decision(key) {
                return NextAction::Ask;
            }
        }
        if let Some(worker_id) = &self.required_worker {
            if !state.flag(&worker_executed_flag(worker_id)) {
                return NextAction::Execute {
                    worker_id: worker_id.clone(),
                };
            }
        }
        NextAction::Complete
    }
}

/// The conventional flag key the engine sets once a schema's required worker
/// has run, so `next_action` doesn't re-dispatch it forever.
pub fn worker_executed_flag(worker_id: &str) -> String {
    format!("worker_executed:{}", worker_id)
}

/// Holds every registered [`TaskSchema`] plus a `general` fallback, and maps
/// an incoming request to the schema that should govern it.
pub struct TaskSchemaRegistry {
    schemas: HashMap<String, Arc<TaskSchema>>,
    fallback: Arc<TaskSchema>,
}

impl TaskSchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
            fallback: Arc::new(TaskSchema::new("general")),
        }
    }

    pub fn register(&mut self, schema: TaskSchema) {
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskSchema>> {
        self.schemas.get(name).cloned()
    }

    /// Infer a schema for `request` via keyword matching over registered
    /// schema names and a small built-in keyword table, falling back to
    /// `general` when nothing matches.
    ///
    /// A production deployment would typically try an LLM classification
    /// first and fall back to this keyword heuristic on failure or timeout;
    /// the core only specifies the deterministic fallback path since the LLM
    /// call itself goes through the same `Completion` capability used
    /// elsewhere (planner, Q&A, extractor).
    pub fn infer_from_request(&self, request: &str) -> Arc<TaskSchema> {
        let lowered = request.to_ascii_lowercase();
        for (name, schema) in &self.schemas {
            if lowered.contains(name.as_str()) {
                return schema.clone();
            }
        }
        for (keyword, name) in KEYWORD_TABLE {
            if lowered.contains(keyword) {
                if let Some(schema) = self.schemas.get(*name) {
                    return schema.clone();
                }
            }
        }
        self.fallback.clone()
    }
}

impl Default for TaskSchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const KEYWORD_TABLE: &[(&str, &str)] = &[
    ("book a table", "reservation"),
    ("reservation", "reservation"),
    ("restaurant", "reservation"),
];
