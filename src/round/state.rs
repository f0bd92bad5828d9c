//! Round lifecycle state machine.

use crate::core::{now, Error, Result, RoundNumber, Timestamp};
use serde::{Deserialize, Serialize};

/// Why training stopped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Round budget used up
    BudgetExhausted,
    /// Convergence criterion met
    Converged,
    /// Retries exhausted for a round
    Fatal { round: RoundNumber, cause: String },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::BudgetExhausted => write!(f, "round budget exhausted"),
            TerminationReason::Converged => write!(f, "converged"),
            TerminationReason::Fatal { round, cause } => {
                write!(f, "fatal failure in round {}: {}", round, cause)
            }
        }
    }
}

/// Phase of the round controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundPhase {
    /// Waiting to start a round
    Idle,
    /// Sending the global snapshot to workers
    Broadcasting,
    /// Waiting for worker updates
    Collecting,
    /// Combining updates
    Aggregating,
    /// Replacing the global state
    Applying,
    /// Validation and stopping checks
    Evaluating,
    /// Final; no transition leaves this phase
    Terminated(TerminationReason),
}

impl RoundPhase {
    fn label(&self) -> &'static str {
        match self {
            RoundPhase::Idle => "idle",
            RoundPhase::Broadcasting => "broadcasting",
            RoundPhase::Collecting => "collecting",
            RoundPhase::Aggregating => "aggregating",
            RoundPhase::Applying => "applying",
            RoundPhase::Evaluating => "evaluating",
            RoundPhase::Terminated(_) => "terminated",
        }
    }

    /// Whether this phase is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundPhase::Terminated(_))
    }

    /// Whether `next` is a legal successor.
    pub fn can_transition_to(&self, next: &RoundPhase) -> bool {
        use RoundPhase::*;
        matches!(
            (self, next),
            (Idle, Broadcasting)
                | (Idle, Terminated(_))
                | (Broadcasting, Collecting)
                | (Broadcasting, Idle)
                | (Collecting, Aggregating)
                | (Collecting, Idle)
                | (Aggregating, Applying)
                | (Aggregating, Idle)
                | (Applying, Evaluating)
                | (Evaluating, Idle)
                | (Evaluating, Terminated(_))
        )
    }
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Tracks the current phase and the time it was entered.
#[derive(Clone, Debug)]
pub struct RoundStateMachine {
    phase: RoundPhase,
    entered_at: Timestamp,
    transitions: u64,
}

impl RoundStateMachine {
    /// Start in `Idle`.
    pub fn new() -> Self {
        Self {
            phase: RoundPhase::Idle,
            entered_at: now(),
            transitions: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &RoundPhase {
        &self.phase
    }

    /// When the current phase was entered.
    pub fn entered_at(&self) -> Timestamp {
        self.entered_at
    }

    /// Number of transitions taken so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Whether the machine reached `Terminated`.
    pub fn is_terminated(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Move to `next` if the edge exists.
    pub fn transition(&mut self, next: RoundPhase) -> Result<()> {
        if !self.phase.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        tracing::trace!(from = %self.phase, to = %next, "Round phase transition");
        self.phase = next;
        self.entered_at = now();
        self.transitions += 1;
        Ok(())
    }
}

impl Default for RoundStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_phases() -> Vec<RoundPhase> {
        vec![
            RoundPhase::Idle,
            RoundPhase::Broadcasting,
            RoundPhase::Collecting,
            RoundPhase::Aggregating,
            RoundPhase::Applying,
            RoundPhase::Evaluating,
            RoundPhase::Terminated(TerminationReason::Converged),
        ]
    }

    #[test]
    fn test_happy_path() {
        let mut machine = RoundStateMachine::new();
        for next in [
            RoundPhase::Broadcasting,
            RoundPhase::Collecting,
            RoundPhase::Aggregating,
            RoundPhase::Applying,
            RoundPhase::Evaluating,
            RoundPhase::Idle,
        ] {
            machine.transition(next).unwrap();
        }
        assert_eq!(machine.phase(), &RoundPhase::Idle);
        assert_eq!(machine.transitions(), 6);
    }

    #[test]
    fn test_failed_aggregation_returns_to_idle() {
        let mut machine = RoundStateMachine::new();
        machine.transition(RoundPhase::Broadcasting).unwrap();
        machine.transition(RoundPhase::Collecting).unwrap();
        machine.transition(RoundPhase::Aggregating).unwrap();
        machine.transition(RoundPhase::Idle).unwrap();
        machine
            .transition(RoundPhase::Terminated(TerminationReason::Fatal {
                round: 1,
                cause: "no updates".into(),
            }))
            .unwrap();
        assert!(machine.is_terminated());
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        let mut machine = RoundStateMachine::new();
        let err = machine.transition(RoundPhase::Aggregating).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidTransition {
                from: "idle".into(),
                to: "aggregating".into()
            }
        );
        assert_eq!(machine.phase(), &RoundPhase::Idle);
    }

    #[test]
    fn test_terminated_is_final() {
        let mut machine = RoundStateMachine::new();
        machine
            .transition(RoundPhase::Terminated(TerminationReason::BudgetExhausted))
            .unwrap();

        for next in all_phases() {
            assert!(machine.transition(next).is_err());
        }
        assert!(machine.is_terminated());
    }

    #[test]
    fn test_applying_cannot_fail_back() {
        assert!(!RoundPhase::Applying.can_transition_to(&RoundPhase::Idle));
        assert!(!RoundPhase::Collecting
            .can_transition_to(&RoundPhase::Terminated(TerminationReason::Converged)));
    }

    #[test]
    fn test_reason_display() {
        let reason = TerminationReason::Fatal {
            round: 2,
            cause: "quorum".into(),
        };
        assert_eq!(reason.to_string(), "fatal failure in round 2: quorum");
    }
}
