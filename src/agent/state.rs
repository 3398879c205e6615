//! Agent lifecycle state machine (spec.md 4.4).
//!
//! ```text
//!  spawning -> ready -> claiming -> working -> merging -> idle
//!     |                     |          |                    |
//!     v                     v          v                    v
//!   error                 idle     shutting_down      shutting_down
//!                                        |
//!                                        v
//!                                     stopped
//! ```

use crate::models::AgentState;

/// Emitted on every state transition so the orchestrator can observe
/// agent progress without polling (spec.md 4.4's "every transition emits
/// a StateChanged event").
#[derive(Debug, Clone)]
pub struct StateChanged {
    pub agent_id: String,
    pub from: AgentState,
    pub to: AgentState,
}

/// True iff `from -> to` is one of the edges spec.md 4.4 draws.
/// `shutting_down -> stopped` and `* -> shutting_down` (via a shutdown
/// request, handled out of band) are always legal. `spawning -> error`
/// is the one other terminal-failure edge the diagram draws; `error` is
/// otherwise a dead end — a failed agent is never recycled in place.
pub fn is_valid_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    if to == ShuttingDown || (from == ShuttingDown && to == Stopped) {
        return true;
    }
    matches!(
        (from, to),
        (Spawning, Ready)
            | (Spawning, Error)
            | (Ready, Claiming)
            | (Claiming, Working)
            | (Claiming, Idle)
            | (Working, Merging)
            | (Working, Idle)
            | (Merging, Idle)
            | (Idle, Claiming)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::*;

    #[test]
    fn accepts_the_documented_happy_path() {
        assert!(is_valid_transition(Spawning, Ready));
        assert!(is_valid_transition(Ready, Claiming));
        assert!(is_valid_transition(Claiming, Working));
        assert!(is_valid_transition(Working, Merging));
        assert!(is_valid_transition(Merging, Idle));
        assert!(is_valid_transition(Idle, Claiming));
    }

    #[test]
    fn rejects_skipping_claiming() {
        assert!(!is_valid_transition(Ready, Working));
    }

    #[test]
    fn spawn_failure_goes_to_error_and_error_is_a_dead_end() {
        assert!(is_valid_transition(Spawning, Error));
        assert!(!is_valid_transition(Error, Ready));
        assert!(!is_valid_transition(Error, Claiming));
    }

    #[test]
    fn shutting_down_is_reachable_from_any_state() {
        assert!(is_valid_transition(Working, ShuttingDown));
        assert!(is_valid_transition(Idle, ShuttingDown));
        assert!(is_valid_transition(Claiming, ShuttingDown));
    }
}
