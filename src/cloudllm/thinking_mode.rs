//! §4.11 Thinking-Mode State Machine — a per-agent bookkeeping sub-state
//! reflected in status events. It never gates execution on its own; the
//! orchestration engine's control flow is entirely driven by [`crate::cloudllm::workflow::AgentResult`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingState {
    Idle,
    Exploring,
    Structuring,
    Validating,
    Summarizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingEvent {
    StartTask,
    InfoCollected,
    StructureComplete,
    ValidationPassed,
    ValidationFailed,
    NeedMoreInfo,
    RestructureNeeded,
    TaskComplete,
    Pause,
    Resume,
    Reset,
}

#[derive(Debug)]
pub struct InvalidTransition {
    pub state: ThinkingState,
    pub event: ThinkingEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {:?} is not valid in state {:?}", self.event, self.state)
    }
}

impl std::error::Error for InvalidTransition {}

/// One agent's thinking-mode sub-state. `paused` tracks whether the machine
/// is currently paused (in which case only `Resume`/`Reset` are honored,
/// independent of the underlying `state`).
pub struct ThinkingModeMachine {
    state: ThinkingState,
    paused: bool,
}

impl ThinkingModeMachine {
    pub fn new() -> Self {
        Self {
            state: ThinkingState::Idle,
            paused: false,
        }
    }

    pub fn state(&self) -> ThinkingState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn apply(&mut self, event: ThinkingEvent) -> Result<ThinkingState, InvalidTransition> {
        if event == ThinkingEvent::Reset {
            self.state = ThinkingState::Idle;
            self.paused = false;
            return Ok(self.state);
        }

        if self.paused {
            return match event {
                ThinkingEvent::Resume => {
                    self.paused = false;
                    Ok(self.state)
                }
                _ => Err(InvalidTransition {
                    state: self.state,
                    event,
                }),
            };
        }

        if event == ThinkingEvent::Pause {
            self.paused = true;
            return Ok(self.state);
        }

        let next = match (self.state, event) {
            (ThinkingState::Idle, ThinkingEvent::StartTask) => ThinkingState::Exploring,
            (ThinkingState::Exploring, ThinkingEvent::InfoCollected) => ThinkingState::Structuring,
            (ThinkingState::Structuring, ThinkingEvent::StructureComplete) => ThinkingState::Validating,
            (ThinkingState::Validating, ThinkingEvent::ValidationPassed) => ThinkingState::Summarizing,
            (ThinkingState::Summarizing, ThinkingEvent::TaskComplete) => ThinkingState::Idle,
            (ThinkingState::Validating, ThinkingEvent::ValidationFailed) => ThinkingState::Exploring,
            (_, ThinkingEvent::NeedMoreInfo) => ThinkingState::Exploring,
            (ThinkingState::Validating, ThinkingEvent::RestructureNeeded) => ThinkingState::Structuring,
            _ => {
                return Err(InvalidTransition {
                    state: self.state,
                    event,
                })
            }
        };
        self.state = next;
        Ok(self.state)
    }
}

impl Default for ThinkingModeMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_cycles_back_to_idle() {
        let mut m = ThinkingModeMachine::new();
        m.apply(ThinkingEvent::StartTask).unwrap();
        assert_eq!(m.state(), ThinkingState::Exploring);
        m.apply(ThinkingEvent::InfoCollected).unwrap();
        assert_eq!(m.state(), ThinkingState::Structuring);
        m.apply(ThinkingEvent::StructureComplete).unwrap();
        assert_eq!(m.state(), ThinkingState::Validating);
        m.apply(ThinkingEvent::ValidationPassed).unwrap();
        assert_eq!(m.state(), ThinkingState::Summarizing);
        m.apply(ThinkingEvent::TaskComplete).unwrap();
        assert_eq!(m.state(), ThinkingState::Idle);
    }

    #[test]
    fn validation_failure_backtracks_to_exploring() {
        let mut m = ThinkingModeMachine::new();
        m.apply(ThinkingEvent::StartTask).unwrap();
        m.apply(ThinkingEvent::InfoCollected).unwrap();
        m.apply(ThinkingEvent::StructureComplete).unwrap();
        m.apply(ThinkingEvent::ValidationFailed).unwrap();
        assert_eq!(m.state(), ThinkingState::Exploring);
    }

    #[test]
    fn paused_machine_only_honors_resume_and_reset() {
        let mut m = ThinkingModeMachine::new();
        m.apply(ThinkingEvent::StartTask).unwrap();
        m.apply(ThinkingEvent::Pause).unwrap();
        assert!(m.is_paused());
        assert!(m.apply(ThinkingEvent::InfoCollected).is_err());
        m.apply(ThinkingEvent::Resume).unwrap();
        assert!(!m.is_paused());
        assert_eq!(m.state(), ThinkingState::Exploring);
    }

    #[test]
    fn reset_is_universal() {
        let mut m = ThinkingModeMachine::new();
        m.apply(ThinkingEvent::StartTask).unwrap();
        m.apply(ThinkingEvent::Pause).unwrap();
        m.apply(ThinkingEvent::Reset).unwrap();
        assert_eq!(m.state(), ThinkingState::Idle);
        assert!(!m.is_paused());
    }
}
