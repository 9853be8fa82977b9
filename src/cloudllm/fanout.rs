//! §4.10 fan-out adapter — a small axum HTTP surface over [`OrchestrationEngine`]
//! and its [`EventStore`], external to the core engine itself. Only compiled
//! when the `fanout-server` feature is enabled.
//!
//! Routes:
//! - `POST /tasks/:task_id` — `chat_message`: starts or drives a task.
//! - `POST /tasks/:task_id/resume` — `task_interaction`: answers a
//!   `WAITING_USER` gate.
//! - `GET /tasks/:task_id/events` — `request_task_events`: full history for
//!   one task.
//! - `GET /events/recent?count=N` — most recent N global events, for a
//!   client's first connect.
//! - `GET /events/since?cursor=<ts>&client_id=<id>&limit=N` — replay missed
//!   events since a saved cursor, then advance it (at-least-once delivery).

use crate::cloudllm::orchestration_engine::OrchestrationEngine;
use crate::cloudllm::planner::AvailableAgent;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Body of `POST /tasks/:task_id`, mirroring the `assign_task`/`chat_message`
/// client-to-core messages.
#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
    #[serde(default)]
    pub available_agents: Vec<AvailableAgent>,
    #[serde(default)]
    pub ext_meta: Option<serde_json::Value>,
}

/// Body of `POST /tasks/:task_id/resume`, mirroring `task_interaction`.
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_count")]
    pub count: usize,
}

fn default_recent_count() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    pub client_id: String,
    #[serde(default)]
    pub cursor: Option<f64>,
    #[serde(default = "default_since_limit")]
    pub limit: usize,
}

fn default_since_limit() -> usize {
    100
}

/// Build the axum `Router` for this adapter. Mount it under any path prefix
/// the embedding application wants (`Router::nest`).
pub fn router(engine: OrchestrationEngine) -> Router {
    Router::new()
        .route("/tasks/{task_id}", post(handle_chat_message))
        .route("/tasks/{task_id}/resume", post(handle_resume))
        .route("/tasks/{task_id}/events", get(handle_task_events))
        .route("/events/recent", get(handle_recent_events))
        .route("/events/since", get(handle_events_since))
        .with_state(engine)
}

async fn handle_chat_message(
    State(engine): State<OrchestrationEngine>,
    Path(task_id): Path<String>,
    Json(request): Json<ChatMessageRequest>,
) -> impl IntoResponse {
    let reply = engine
        .process_request(
            &task_id,
            &request.message,
            request.available_agents,
            request.ext_meta,
            CancellationToken::new(),
        )
        .await;
    (StatusCode::OK, Json(serde_json::json!({ "message": reply })))
}

async fn handle_resume(
    State(engine): State<OrchestrationEngine>,
    Path(task_id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> impl IntoResponse {
    let reply = engine
        .resume_with_user_input(&task_id, &request.message, CancellationToken::new())
        .await;
    (StatusCode::OK, Json(serde_json::json!({ "message": reply })))
}

async fn handle_task_events(
    State(engine): State<OrchestrationEngine>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    use crate::cloudllm::event_store::payloads;

    let events = engine.events().task_events(&task_id);
    let (event_type, payload) = payloads::task_events_response(&task_id, &events);
    (StatusCode::OK, Json(serde_json::json!({ "type": event_type, "payload": payload })))
}

async fn handle_recent_events(
    State(engine): State<OrchestrationEngine>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let events = engine.events().recent_events(query.count);
    (StatusCode::OK, Json(events))
}

/// Replays events past the client's saved cursor (or the most recent N if
/// the client has none yet), then advances the cursor to the latest
/// delivered timestamp. Delivery is at-least-once: a client that never
/// acknowledges will see the same tail again on its next poll.
async fn handle_events_since(
    State(engine): State<OrchestrationEngine>,
    Query(query): Query<SinceQuery>,
) -> impl IntoResponse {
    let store = engine.events();
    let since = query
        .cursor
        .or_else(|| store.client_cursor(&query.client_id));

    let events = match since {
        Some(ts) => store.events_since(ts, query.limit),
        None => store.recent_events(query.limit),
    };

    if let Some(last) = events.last() {
        store.save_client_cursor(&query.client_id, last.timestamp);
    }

    (StatusCode::OK, Json(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::agent_executor::WorkerRegistry;
    use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role};
    use crate::cloudllm::config::EngineConfig;
    use crate::cloudllm::task_schema::TaskSchemaRegistry;
    use crate::cloudllm::workflow_repository::InMemoryWorkflowRepository;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct StubCompletion;

    #[async_trait]
    impl ClientWrapper for StubCompletion {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::cloudllm::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let plan = r#"{"analysis": "fail fast", "steps": []}"#;
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(plan),
                tool_calls: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn test_engine() -> OrchestrationEngine {
        OrchestrationEngine::new(
            Arc::new(StubCompletion),
            WorkerRegistry::new(),
            Arc::new(InMemoryWorkflowRepository::new()),
            TaskSchemaRegistry::new(),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn recent_events_endpoint_returns_ok() {
        let app = router(test_engine());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events/recent?count=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_message_creates_a_task() {
        let app = router(test_engine());
        let body = serde_json::json!({ "message": "hello", "available_agents": [] });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks/t1")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
