//! Fragment run state machine.
//!
//! ```text
//! Received → Triaged → Discarded ───────────────────────┐
//!                    └→ Extracted → CitasDatos → Normalized ┴→ PayloadBuilt → Persisted
//!                                                                       └→ PersistFailed
//! ```
//!
//! Any non-terminal state may also move to `Failed`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentState {
    Received,
    Triaged,
    Discarded,
    Extracted,
    CitasDatos,
    Normalized,
    PayloadBuilt,
    Persisted,
    PersistFailed,
    Failed,
}

impl FragmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentState::Received => "Received",
            FragmentState::Triaged => "Triaged",
            FragmentState::Discarded => "Discarded",
            FragmentState::Extracted => "Extracted",
            FragmentState::CitasDatos => "CitasDatos",
            FragmentState::Normalized => "Normalized",
            FragmentState::PayloadBuilt => "PayloadBuilt",
            FragmentState::Persisted => "Persisted",
            FragmentState::PersistFailed => "PersistFailed",
            FragmentState::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            FragmentState::Received,
            FragmentState::Triaged,
            FragmentState::Discarded,
            FragmentState::Extracted,
            FragmentState::CitasDatos,
            FragmentState::Normalized,
            FragmentState::PayloadBuilt,
            FragmentState::Persisted,
            FragmentState::PersistFailed,
            FragmentState::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FragmentState::Persisted | FragmentState::PersistFailed | FragmentState::Failed
        )
    }

    pub fn can_transition_to(&self, next: FragmentState) -> bool {
        use FragmentState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Received, Triaged)
                | (Triaged, Discarded)
                | (Triaged, Extracted)
                | (Extracted, CitasDatos)
                | (CitasDatos, Normalized)
                | (Discarded, PayloadBuilt)
                | (Normalized, PayloadBuilt)
                | (PayloadBuilt, Persisted)
                | (PayloadBuilt, PersistFailed)
        )
    }

    /// Rough completion estimate for progress reporting.
    pub fn progress(&self) -> f64 {
        match self {
            FragmentState::Received => 0.05,
            FragmentState::Triaged => 0.2,
            FragmentState::Discarded => 0.8,
            FragmentState::Extracted => 0.45,
            FragmentState::CitasDatos => 0.65,
            FragmentState::Normalized => 0.8,
            FragmentState::PayloadBuilt => 0.9,
            FragmentState::Persisted | FragmentState::PersistFailed | FragmentState::Failed => 1.0,
        }
    }
}

impl fmt::Display for FragmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notified on every state change of a run.
pub trait StateObserver: Send + Sync {
    fn on_transition(&self, fragment_id: &str, from: FragmentState, to: FragmentState);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl StateObserver for NoopObserver {
    fn on_transition(&self, _fragment_id: &str, _from: FragmentState, _to: FragmentState) {}
}

/// Current state plus the path that led to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    current: FragmentState,
    history: Vec<FragmentState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: FragmentState::Received,
            history: vec![FragmentState::Received],
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> FragmentState {
        self.current
    }

    pub fn history(&self) -> &[FragmentState] {
        &self.history
    }

    pub fn transition(&mut self, next: FragmentState) -> Result<FragmentState, ProcessingError> {
        if !self.current.can_transition_to(next) {
            return Err(ProcessingError::InvalidTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        let previous = self.current;
        self.current = next;
        self.history.push(next);
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FragmentState::*;

    #[test]
    fn full_path_is_valid() {
        let mut sm = StateMachine::default();
        for next in [Triaged, Extracted, CitasDatos, Normalized, PayloadBuilt, Persisted] {
            sm.transition(next).unwrap();
        }
        assert_eq!(sm.history().len(), 7);
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn discarded_path_skips_extraction() {
        let mut sm = StateMachine::default();
        sm.transition(Triaged).unwrap();
        sm.transition(Discarded).unwrap();
        assert!(sm.transition(Extracted).is_err());
        sm.transition(PayloadBuilt).unwrap();
        sm.transition(PersistFailed).unwrap();
    }

    #[test]
    fn phases_cannot_be_skipped_or_reversed() {
        let mut sm = StateMachine::default();
        assert!(sm.transition(Extracted).is_err());
        sm.transition(Triaged).unwrap();
        assert!(sm.transition(Received).is_err());
        assert_eq!(sm.current(), Triaged);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut sm = StateMachine::default();
        sm.transition(Failed).unwrap();
        assert!(sm.transition(Failed).is_err());
        assert!(sm.transition(Triaged).is_err());
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(FragmentState::parse("CitasDatos"), Some(CitasDatos));
        assert_eq!(FragmentState::parse("nope"), None);
    }
}
