//! The saga state machine.
//!
//! [`decide`] maps a saga's recorded position and failure flags to the one
//! action that may run next. It performs no I/O.

use serde::{Deserialize, Serialize};

use crate::instance::SagaInstance;
use crate::state::{Position, SagaStatus};
use crate::step::{Action, Step};

/// A single action and the position move it performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub action: Action,
    /// The position the saga row must still hold when the action runs.
    pub from: Position,
    /// The position written in the same transaction as the side effect.
    pub to: Position,
}

/// What the coordinator should do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The saga already finished or was cancelled.
    AlreadyTerminal(Position),
    Run(Plan),
}

/// Returns the position an action moves the saga to once it commits.
pub fn target_of(action: Action) -> Position {
    if action == Action::CancelSaga {
        return Position::new(Step::Order, SagaStatus::Cancelled);
    }

    let step = action.step();
    if action.is_compensation() {
        match step.previous() {
            Some(previous) => Position::new(previous, SagaStatus::Cancelling),
            None => Position::new(Step::Order, SagaStatus::Cancelled),
        }
    } else {
        match step.next() {
            Some(next) => Position::new(next, SagaStatus::InProgress),
            None => Position::new(step, SagaStatus::Finished),
        }
    }
}

/// Chooses the next action for a saga.
///
/// A set failure flag on the recorded step means that step can never run,
/// so the last completed step (the one before it) is compensated instead.
/// A flag on `Order` has nothing to undo and cancels the saga outright.
pub fn decide(saga: &SagaInstance) -> Decision {
    let from = saga.position();
    if from.status.is_terminal() {
        return Decision::AlreadyTerminal(from);
    }

    let action = if saga.failures.at(saga.step) {
        match saga.step.previous() {
            Some(completed) => completed.actions().compensate,
            None => Action::CancelSaga,
        }
    } else {
        let actions = saga.step.actions();
        match saga.status {
            SagaStatus::InProgress => actions.forward,
            _ => actions.compensate,
        }
    };

    Decision::Run(Plan {
        action,
        from,
        to: target_of(action),
    })
}
