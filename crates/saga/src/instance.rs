//! The saga instance and its submitted payload.

use std::collections::HashSet;

use common::OrderId;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state::{Position, SagaStatus};
use crate::step::Step;

/// A single product line in an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub quantity: i32,
}

impl LineItem {
    pub fn new(id: impl Into<String>, quantity: i32) -> Self {
        Self {
            id: id.into(),
            quantity,
        }
    }
}

/// Injected permanent failures, one flag per step.
///
/// Missing flags decode as `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Failures {
    pub orders: bool,
    pub payments: bool,
    pub reservations: bool,
    pub shipments: bool,
}

impl Failures {
    /// No injected failures.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns the flag belonging to a step.
    pub fn at(&self, step: Step) -> bool {
        match step {
            Step::Order => self.orders,
            Step::Payment => self.payments,
            Step::Reservation => self.reservations,
            Step::Shipment => self.shipments,
        }
    }

    /// Returns a copy with the flag for `step` set.
    pub fn with(mut self, step: Step) -> Self {
        match step {
            Step::Order => self.orders = true,
            Step::Payment => self.payments = true,
            Step::Reservation => self.reservations = true,
            Step::Shipment => self.shipments = true,
        }
        self
    }
}

/// A saga as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSaga {
    pub order_id: OrderId,
    pub payment: f64,
    #[serde(default)]
    pub products: Vec<LineItem>,
    #[serde(default)]
    pub failures: Failures,
}

impl NewSaga {
    pub fn new(order_id: OrderId, payment: f64, products: Vec<LineItem>) -> Self {
        Self {
            order_id,
            payment,
            products,
            failures: Failures::none(),
        }
    }

    pub fn with_failures(mut self, failures: Failures) -> Self {
        self.failures = failures;
        self
    }

    /// Rejects payloads no step could ever apply.
    pub fn validate(&self) -> Result<()> {
        if !self.payment.is_finite() || self.payment < 0.0 {
            return Err(SagaError::InvalidSaga(format!(
                "payment must be a non-negative amount, got {}",
                self.payment
            )));
        }
        if let Some(item) = self.products.iter().find(|item| item.quantity <= 0) {
            return Err(SagaError::InvalidSaga(format!(
                "product {} has non-positive quantity {}",
                item.id, item.quantity
            )));
        }
        let mut seen = HashSet::new();
        if let Some(item) = self.products.iter().find(|item| !seen.insert(item.id.as_str())) {
            return Err(SagaError::InvalidSaga(format!(
                "product {} appears in more than one line",
                item.id
            )));
        }
        Ok(())
    }
}

/// One distributed transaction, as persisted in the `sagas` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub order_id: OrderId,
    pub payment: f64,
    pub products: Vec<LineItem>,
    pub step: Step,
    pub status: SagaStatus,
    pub failures: Failures,
}

impl SagaInstance {
    /// Builds the initial instance for a submitted saga.
    pub fn submitted(saga: NewSaga) -> Self {
        let position = Position::initial();
        Self {
            order_id: saga.order_id,
            payment: saga.payment,
            products: saga.products,
            step: position.step,
            status: position.status,
            failures: saga.failures,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.step, self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns a copy of this instance moved to `position`.
    pub fn advanced_to(&self, position: Position) -> Self {
        Self {
            step: position.step,
            status: position.status,
            ..self.clone()
        }
    }
}
