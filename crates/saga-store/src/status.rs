//! Step status state machine.

use serde::{Deserialize, Serialize};

/// Execution status of one saga step.
///
/// Legal transitions:
/// ```text
/// None ──► Started ──┬──► Completed ──┬──► Compensated
///                    │                └──► CompensationFailed
///                    └──► Failed ─────┬──► Compensated
///                                     └──► CompensationFailed
/// ```
/// `Compensated` and `CompensationFailed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    /// No status has been recorded for the step.
    #[default]
    None,

    /// The handler began executing the step.
    Started,

    /// The step's side effects happened.
    Completed,

    /// The step failed after retries were exhausted.
    Failed,

    /// The step's compensation ran successfully (terminal).
    Compensated,

    /// The step's compensation raised an error (terminal).
    CompensationFailed,
}

impl StepStatus {
    /// All statuses, in declaration order.
    pub const ALL: [StepStatus; 6] = [
        StepStatus::None,
        StepStatus::Started,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Compensated,
        StepStatus::CompensationFailed,
    ];

    /// Returns true if a write of `next` is legal after `self`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        is_valid_transition(*self, next)
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Compensated | StepStatus::CompensationFailed)
    }

    /// Returns true once the step has run to an outcome.
    ///
    /// A redelivered message whose step is finished must not run its
    /// handler again.
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepStatus::None | StepStatus::Started)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::None => "None",
            StepStatus::Started => "Started",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validates a status change.
pub fn is_valid_transition(previous: StepStatus, next: StepStatus) -> bool {
    use StepStatus::*;

    matches!(
        (previous, next),
        (None, Started)
            | (Started, Completed)
            | (Started, Failed)
            | (Completed, Compensated)
            | (Completed, CompensationFailed)
            | (Failed, Compensated)
            | (Failed, CompensationFailed)
    )
}
