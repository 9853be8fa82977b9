//! §4.10 Event Store & Fan-out.
//!
//! Holds a global time-ordered ring of the most recent N events, a per-task
//! append-only list, and per-client replay cursors. Every timestamp comes
//! from one monotonic counter inside the store (never `Utc::now()` at
//! multiple call sites), so [`EventStore::events_since`] is total-order
//! correct even under concurrent writers (§9 design note).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// One entry in the event log. `timestamp` is a monotonic counter value
/// scaled to look like a float clock reading; it is strictly increasing
/// across the whole store, which is a stronger guarantee than the spec
/// requires (only per-task strict increase) and trivially implies it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: f64,
}

impl Event {
    /// The `taskId` tag on this event's payload, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("taskId").and_then(Value::as_str)
    }
}

struct TaskEvents {
    events: VecDeque<Event>,
    cap: usize,
}

impl TaskEvents {
    fn push(&mut self, event: Event) {
        if self.events.len() >= self.cap {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

struct Inner {
    clock: AtomicU64,
    global: Mutex<VecDeque<Event>>,
    global_cap: usize,
    by_task: Mutex<HashMap<String, TaskEvents>>,
    per_task_cap: usize,
    cursors: Mutex<HashMap<String, f64>>,
}

/// Thread-safe, cloneable handle to the event store (an `Arc`-backed
/// interior-mutability type, matching how the breaker and repository are
/// shared across tasks).
#[derive(Clone)]
pub struct EventStore {
    inner: std::sync::Arc<Inner>,
}

impl EventStore {
    pub fn new(global_cap: usize, per_task_cap: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                clock: AtomicU64::new(1),
                global: Mutex::new(VecDeque::new()),
                global_cap,
                by_task: Mutex::new(HashMap::new()),
                per_task_cap,
                cursors: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn next_timestamp(&self) -> f64 {
        self.inner.clock.fetch_add(1, Ordering::SeqCst) as f64
    }

    /// Store an event, returning its assigned monotonic timestamp. If
    /// `payload.taskId` is set, the event is also appended to that task's list.
    pub fn store_event(&self, event_type: impl Into<String>, payload: Value) -> f64 {
        let timestamp = self.next_timestamp();
        let event = Event {
            event_type: event_type.into(),
            payload,
            timestamp,
        };

        let task_id = event.task_id().map(|s| s.to_string());

        {
            let mut global = self.inner.global.lock().unwrap();
            if global.len() >= self.inner.global_cap {
                global.pop_front();
            }
            global.push_back(event.clone());
        }

        if let Some(task_id) = task_id {
            let mut by_task = self.inner.by_task.lock().unwrap();
            by_task
                .entry(task_id)
                .or_insert_with(|| TaskEvents {
                    events: VecDeque::new(),
                    cap: self.inner.per_task_cap,
                })
                .push(event);
        }

        timestamp
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        let global = self.inner.global.lock().unwrap();
        global.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn events_since(&self, since: f64, limit: usize) -> Vec<Event> {
        let global = self.inner.global.lock().unwrap();
        global
            .iter()
            .filter(|e| e.timestamp > since)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn task_events(&self, task_id: &str) -> Vec<Event> {
        let by_task = self.inner.by_task.lock().unwrap();
        by_task
            .get(task_id)
            .map(|t| t.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn save_client_cursor(&self, client_id: &str, timestamp: f64) {
        self.inner
            .cursors
            .lock()
            .unwrap()
            .insert(client_id.to_string(), timestamp);
    }

    pub fn client_cursor(&self, client_id: &str) -> Option<f64> {
        self.inner.cursors.lock().unwrap().get(client_id).copied()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(1000, 500)
    }
}

/// Typed payload builders for the event types named in the external
/// interface (§6). Each returns the `(type, payload)` pair ready for
/// [`EventStore::store_event`].
pub mod payloads {
    use super::*;
    use chrono::Utc;

    #[derive(Clone, Copy, Debug, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Info,
        Decision,
        Warning,
        Error,
    }

    pub fn agent_log(
        agent_id: &str,
        agent_name: &str,
        level: LogLevel,
        message: &str,
        related_task_id: Option<&str>,
    ) -> (&'static str, Value) {
        (
            "agent_log",
            serde_json::json!({
                "id": Uuid::new_v4().to_string(),
                "agentId": agent_id,
                "agentName": agent_name,
                "type": level,
                "message": message,
                "relatedTaskId": related_task_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }

    #[derive(Clone, Copy, Debug, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum InteractionRole {
        User,
        Agent,
    }

    pub fn task_interaction(
        task_id: &str,
        role: InteractionRole,
        message: &str,
        agent_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> (&'static str, Value) {
        (
            "task_interaction",
            serde_json::json!({
                "id": Uuid::new_v4().to_string(),
                "taskId": task_id,
                "role": role,
                "message": message,
                "agentId": agent_id,
                "agentName": agent_name,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }

    pub fn task_status_change(task_id: &str, phase: &str) -> (&'static str, Value) {
        (
            "task_status_change",
            serde_json::json!({ "taskId": task_id, "phase": phase, "timestamp": Utc::now().to_rfc3339() }),
        )
    }

    pub fn agent_status_change(task_id: &str, agent_id: &str, status: &str) -> (&'static str, Value) {
        (
            "agent_status_change",
            serde_json::json!({
                "taskId": task_id,
                "agentId": agent_id,
                "status": status,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }

    pub fn task_events_response(task_id: &str, events: &[Event]) -> (&'static str, Value) {
        (
            "task_events_response",
            serde_json::json!({ "taskId": task_id, "events": events }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let store = EventStore::new(10, 10);
        let t1 = store.store_event("agent_log", serde_json::json!({}));
        let t2 = store.store_event("agent_log", serde_json::json!({}));
        assert!(t2 > t1);
    }

    #[test]
    fn events_since_is_total_order_correct() {
        let store = EventStore::new(10, 10);
        let t1 = store.store_event("e1", serde_json::json!({}));
        store.store_event("e2", serde_json::json!({}));
        store.store_event("e3", serde_json::json!({}));
        let since = store.events_since(t1, 10);
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].event_type, "e2");
        assert_eq!(since[1].event_type, "e3");
    }

    #[test]
    fn task_events_never_evicted_for_active_tasks_under_cap() {
        let store = EventStore::new(10, 2);
        store.store_event("agent_log", serde_json::json!({"taskId": "t1"}));
        store.store_event("agent_log", serde_json::json!({"taskId": "t1"}));
        store.store_event("agent_log", serde_json::json!({"taskId": "t1"}));
        let events = store.task_events("t1");
        // per-task cap evicts the oldest once exceeded
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn reconnecting_client_replays_missed_events() {
        // Scenario E
        let store = EventStore::new(10, 10);
        let t1 = store.store_event("agent_log", serde_json::json!({}));
        store.save_client_cursor("c1", t1);
        store.store_event("e2", serde_json::json!({}));
        store.store_event("e3", serde_json::json!({}));

        let cursor = store.client_cursor("c1").unwrap();
        let replay = store.events_since(cursor, 100);
        assert_eq!(replay.len(), 2);
        store.save_client_cursor("c1", replay.last().unwrap().timestamp);
        assert!(store.client_cursor("c1").unwrap() > t1);
    }
}
