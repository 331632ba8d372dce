//! Saga status and position.

use serde::{Deserialize, Serialize};

use crate::step::Step;

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// InProgress ──┬──► Finished
///              └──► Cancelling ──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Forward actions are being applied.
    #[default]
    InProgress,

    /// A permanent failure was detected and compensations are running.
    Cancelling,

    /// Every completed step was compensated (terminal state).
    Cancelled,

    /// Every step completed (terminal state).
    Finished,
}

impl SagaStatus {
    pub const ALL: [SagaStatus; 4] = [
        SagaStatus::InProgress,
        SagaStatus::Cancelling,
        SagaStatus::Cancelled,
        SagaStatus::Finished,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Cancelled | SagaStatus::Finished)
    }

    /// Returns the stored name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Cancelling => "cancelling",
            SagaStatus::Cancelled => "cancelled",
            SagaStatus::Finished => "finished",
        }
    }

    /// Parses a stored status name.
    pub fn from_name(name: &str) -> Option<SagaStatus> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == name)
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A saga's `(step, status)` pair.
///
/// The position alone determines which action may run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub step: Step,
    pub status: SagaStatus,
}

impl Position {
    pub fn new(step: Step, status: SagaStatus) -> Self {
        Self { step, status }
    }

    /// The position of a freshly submitted saga.
    pub fn initial() -> Self {
        Self::new(Step::Order, SagaStatus::InProgress)
    }

    /// Parses stored step and status names.
    pub fn from_names(step: &str, status: &str) -> Option<Self> {
        Some(Self::new(Step::from_name(step)?, SagaStatus::from_name(status)?))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.step, self.status)
    }
}
