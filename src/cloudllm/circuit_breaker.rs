//! Per-agent three-state circuit breaker (§4.7): CLOSED → OPEN → HALF_OPEN
//! → CLOSED, guarding calls to a flaky worker or LLM-backed agent.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-agent counters backing the state machine.
#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub failures: u32,
    pub successes: u32,
    pub total_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
}

struct AgentCircuit {
    state: CircuitState,
    stats: CircuitStats,
    half_open_calls: u32,
}

impl Default for AgentCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            stats: CircuitStats::default(),
            half_open_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Returned when a call is rejected because the breaker for `agent_id` is OPEN.
#[derive(Debug)]
pub struct CircuitOpenError {
    pub agent_id: String,
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit open for agent '{}': temporarily unavailable", self.agent_id)
    }
}

impl std::error::Error for CircuitOpenError {}

/// Thread-safe, per-agent circuit breaker. Cloning shares the underlying
/// state (it's an `Arc` handle), matching how the breaker is threaded
/// through the engine and all its tasks.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Arc<Mutex<HashMap<String, AgentCircuit>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Before dispatching a call to `agent_id`, check whether it's allowed to
    /// proceed. Returns `Err` if the breaker is OPEN (or HALF_OPEN with its
    /// probe budget exhausted); this check transitions OPEN → HALF_OPEN when
    /// the timeout has elapsed, but never holds the lock across the caller's
    /// actual agent call.
    pub fn before_call(&self, agent_id: &str) -> Result<(), CircuitOpenError> {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(agent_id.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = circuit
                    .stats
                    .last_failure_time
                    .map(|t| Utc::now().signed_duration_since(t))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_calls = 0;
                    circuit.stats.successes = 0;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        agent_id: agent_id.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.half_open_calls < self.config.half_open_max_calls {
                    circuit.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        agent_id: agent_id.to_string(),
                    })
                }
            }
        }
    }

    /// Record the outcome of a call that [`CircuitBreaker::before_call`]
    /// allowed through.
    pub fn record_success(&self, agent_id: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(agent_id.to_string()).or_default();
        circuit.stats.successes += 1;
        circuit.stats.total_calls += 1;
        circuit.stats.last_success_time = Some(Utc::now());

        match circuit.state {
            CircuitState::Closed => {
                circuit.stats.failures = 0;
                circuit.stats.successes = 0;
            }
            CircuitState::HalfOpen => {
                if circuit.stats.successes >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.stats.failures = 0;
                    circuit.stats.successes = 0;
                    circuit.half_open_calls = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        let circuit = circuits.entry(agent_id.to_string()).or_default();
        circuit.stats.failures += 1;
        circuit.stats.total_calls += 1;
        circuit.stats.last_failure_time = Some(Utc::now());

        match circuit.state {
            CircuitState::Closed => {
                if circuit.stats.failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.stats.successes = 0;
                circuit.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state_of(&self, agent_id: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap();
        circuits
            .get(agent_id)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats_of(&self, agent_id: &str) -> CircuitStats {
        let circuits = self.circuits.lock().unwrap();
        circuits
            .get(agent_id)
            .map(|c| c.stats.clone())
            .unwrap_or_default()
    }

    /// Run `call` through the breaker: reject immediately if OPEN/exhausted,
    /// otherwise run it and feed the `Result` back into the state machine.
    /// Never holds the internal lock while `call` is executing.
    pub async fn call<F, Fut, T, E>(&self, agent_id: &str, call: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.before_call(agent_id)
            .map_err(CircuitCallError::Open)?;
        match call().await {
            Ok(value) => {
                self.record_success(agent_id);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(agent_id);
                Err(CircuitCallError::Inner(err))
            }
        }
    }
}

/// Outcome of [`CircuitBreaker::call`]: either the breaker itself rejected
/// the call, or the wrapped call ran and failed.
#[derive(Debug)]
pub enum CircuitCallError<E> {
    Open(CircuitOpenError),
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for CircuitCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitCallError::Open(e) => write!(f, "{}", e),
            CircuitCallError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitCallError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            breaker.before_call("agent-a").unwrap();
            breaker.record_failure("agent-a");
        }
        assert_eq!(breaker.state_of("agent-a"), CircuitState::Open);
        assert!(breaker.before_call("agent-a").is_err());
    }

    #[test]
    fn half_open_recovers_after_success_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_secs(0),
            half_open_max_calls: 3,
        });
        breaker.before_call("agent-b").unwrap();
        breaker.record_failure("agent-b");
        assert_eq!(breaker.state_of("agent-b"), CircuitState::Open);

        // timeout is zero, so the next before_call transitions to half-open
        breaker.before_call("agent-b").unwrap();
        assert_eq!(breaker.state_of("agent-b"), CircuitState::HalfOpen);
        breaker.record_success("agent-b");
        assert_eq!(breaker.state_of("agent-b"), CircuitState::HalfOpen);
        breaker.before_call("agent-b").unwrap();
        breaker.record_success("agent-b");
        assert_eq!(breaker.state_of("agent-b"), CircuitState::Closed);
    }

    #[test]
    fn half_open_requires_consecutive_successes_even_after_long_closed_history() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_secs(0),
            half_open_max_calls: 3,
        });
        // Accumulate plenty of successes while closed.
        for _ in 0..5 {
            breaker.before_call("agent-d").unwrap();
            breaker.record_success("agent-d");
        }
        breaker.before_call("agent-d").unwrap();
        breaker.record_failure("agent-d");
        assert_eq!(breaker.state_of("agent-d"), CircuitState::Open);

        breaker.before_call("agent-d").unwrap();
        assert_eq!(breaker.state_of("agent-d"), CircuitState::HalfOpen);
        breaker.record_success("agent-d");
        // Only one half-open success so far; must not close prematurely.
        assert_eq!(breaker.state_of("agent-d"), CircuitState::HalfOpen);
        breaker.before_call("agent-d").unwrap();
        breaker.record_success("agent-d");
        assert_eq!(breaker.state_of("agent-d"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(0),
            ..Default::default()
        });
        breaker.before_call("agent-c").unwrap();
        breaker.record_failure("agent-c");
        breaker.before_call("agent-c").unwrap();
        assert_eq!(breaker.state_of("agent-c"), CircuitState::HalfOpen);
        breaker.record_failure("agent-c");
        assert_eq!(breaker.state_of("agent-c"), CircuitState::Open);
    }
}
