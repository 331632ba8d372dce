//! Saga steps and the step registry.

use serde::{Deserialize, Serialize};

/// Position in the forward pipeline.
///
/// Steps are ordered: `Order < Payment < Reservation < Shipment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Order,
    Payment,
    Reservation,
    Shipment,
}

impl Step {
    /// All steps in pipeline order.
    pub const ALL: [Step; 4] = [Step::Order, Step::Payment, Step::Reservation, Step::Shipment];

    /// Returns the step after this one, or None for the last step.
    pub fn next(self) -> Option<Step> {
        match self {
            Step::Order => Some(Step::Payment),
            Step::Payment => Some(Step::Reservation),
            Step::Reservation => Some(Step::Shipment),
            Step::Shipment => None,
        }
    }

    /// Returns the step before this one, or None for the first step.
    pub fn previous(self) -> Option<Step> {
        match self {
            Step::Order => None,
            Step::Payment => Some(Step::Order),
            Step::Reservation => Some(Step::Payment),
            Step::Shipment => Some(Step::Reservation),
        }
    }

    /// Looks up the action pair for this step.
    pub fn actions(self) -> StepActions {
        actions_for(self)
    }

    /// Returns the stored name of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Order => "order",
            Step::Payment => "payment",
            Step::Reservation => "reservation",
            Step::Shipment => "shipment",
        }
    }

    /// Parses a stored step name.
    pub fn from_name(name: &str) -> Option<Step> {
        Step::ALL.into_iter().find(|step| step.as_str() == name)
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single store-side action the coordinator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateOrder,
    CancelOrder,
    CreatePayment,
    CancelPayment,
    CreateReservations,
    DeleteReservations,
    CreateShipment,
    CancelShipment,
    /// Marks the saga cancelled without touching any side-effect table.
    /// Used when the very first step is the one that fails.
    CancelSaga,
}

impl Action {
    /// Returns the step whose side effect this action writes.
    pub fn step(&self) -> Step {
        match self {
            Action::CreateOrder | Action::CancelOrder | Action::CancelSaga => Step::Order,
            Action::CreatePayment | Action::CancelPayment => Step::Payment,
            Action::CreateReservations | Action::DeleteReservations => Step::Reservation,
            Action::CreateShipment | Action::CancelShipment => Step::Shipment,
        }
    }

    /// Returns true for compensating (undo) actions.
    pub fn is_compensation(&self) -> bool {
        !matches!(
            self,
            Action::CreateOrder
                | Action::CreatePayment
                | Action::CreateReservations
                | Action::CreateShipment
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateOrder => "create_order",
            Action::CancelOrder => "cancel_order",
            Action::CreatePayment => "create_payment",
            Action::CancelPayment => "cancel_payment",
            Action::CreateReservations => "create_reservations",
            Action::DeleteReservations => "delete_reservations",
            Action::CreateShipment => "create_shipment",
            Action::CancelShipment => "cancel_shipment",
            Action::CancelSaga => "cancel_saga",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The forward and compensating action registered for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepActions {
    pub forward: Action,
    pub compensate: Action,
}

/// Step registry: the `(forward, compensate)` pair for each step.
pub fn actions_for(step: Step) -> StepActions {
    match step {
        Step::Order => StepActions {
            forward: Action::CreateOrder,
            compensate: Action::CancelOrder,
        },
        Step::Payment => StepActions {
            forward: Action::CreatePayment,
            compensate: Action::CancelPayment,
        },
        Step::Reservation => StepActions {
            forward: Action::CreateReservations,
            compensate: Action::DeleteReservations,
        },
        Step::Shipment => StepActions {
            forward: Action::CreateShipment,
            compensate: Action::CancelShipment,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_ordered() {
        assert!(Step::Order < Step::Payment);
        assert!(Step::Payment < Step::Reservation);
        assert!(Step::Reservation < Step::Shipment);
    }

    #[test]
    fn test_next_and_previous_are_inverse() {
        for step in Step::ALL {
            if let Some(next) = step.next() {
                assert_eq!(next.previous(), Some(step));
                assert!(next > step);
            }
        }
        assert_eq!(Step::Order.previous(), None);
        assert_eq!(Step::Shipment.next(), None);
    }

    #[test]
    fn test_registry_pairs_belong_to_their_step() {
        for step in Step::ALL {
            let actions = actions_for(step);
            assert_eq!(actions.forward.step(), step);
            assert_eq!(actions.compensate.step(), step);
            assert!(!actions.forward.is_compensation());
            assert!(actions.compensate.is_compensation());
        }
    }

    #[test]
    fn test_reservation_compensation_deletes() {
        assert_eq!(
            Step::Reservation.actions().compensate,
            Action::DeleteReservations
        );
    }

    #[test]
    fn test_cancel_saga_is_compensation_on_order() {
        assert!(Action::CancelSaga.is_compensation());
        assert_eq!(Action::CancelSaga.step(), Step::Order);
    }

    #[test]
    fn test_name_roundtrip() {
        for step in Step::ALL {
            assert_eq!(Step::from_name(step.as_str()), Some(step));
        }
        assert_eq!(Step::from_name("refund"), None);
    }

    #[test]
    fn test_serialization_uses_stored_names() {
        assert_eq!(
            serde_json::to_string(&Step::Reservation).unwrap(),
            "\"reservation\""
        );
        assert_eq!(
            serde_json::to_string(&Action::DeleteReservations).unwrap(),
            "\"delete_reservations\""
        );
    }
}
