//! The transactional relational store that owns sagas and their side effects.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use common::OrderId;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::instance::{LineItem, SagaInstance};
use crate::state::Position;

pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;

/// Status of an order, payment, or shipment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Cancelled,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "active" => Some(RecordStatus::Active),
            "cancelled" => Some(RecordStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub amount: f64,
    pub status: RecordStatus,
}

/// Snapshot of the side-effect rows owned by one saga.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideEffects {
    pub order: Option<RecordStatus>,
    pub payment: Option<PaymentRecord>,
    pub reservations: Vec<LineItem>,
    pub shipment: Option<RecordStatus>,
}

/// Store holding saga rows and the per-step side-effect tables.
#[async_trait]
pub trait SagaStore: Send + Sync {
    type Tx: StepTransaction;

    /// Opens a transaction. Dropping it without [`StepTransaction::commit`]
    /// rolls back every write made through it.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Persists a newly submitted saga.
    ///
    /// Fails with `AlreadyExists` if the order ID was used before.
    async fn insert_saga(&self, saga: &SagaInstance) -> Result<()>;

    async fn get_saga(&self, order_id: OrderId) -> Result<Option<SagaInstance>>;

    async fn side_effects(&self, order_id: OrderId) -> Result<SideEffects>;
}

/// Writes performed atomically for one saga step.
///
/// Inserts are idempotent; repeating one leaves the existing row untouched.
#[async_trait]
pub trait StepTransaction: Send {
    /// Locks the saga row for the rest of the transaction and returns its
    /// current position, or None if the saga does not exist.
    async fn lock_saga(&mut self, order_id: OrderId) -> Result<Option<Position>>;

    async fn update_saga(&mut self, order_id: OrderId, position: Position) -> Result<()>;

    async fn insert_order(&mut self, order_id: OrderId) -> Result<()>;

    async fn cancel_order(&mut self, order_id: OrderId) -> Result<()>;

    async fn insert_payment(&mut self, order_id: OrderId, amount: f64) -> Result<()>;

    async fn cancel_payment(&mut self, order_id: OrderId) -> Result<()>;

    async fn insert_reservation(&mut self, order_id: OrderId, item: &LineItem) -> Result<()>;

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<()>;

    async fn insert_shipment(&mut self, order_id: OrderId) -> Result<()>;

    async fn cancel_shipment(&mut self, order_id: OrderId) -> Result<()>;

    async fn commit(self) -> Result<()>;
}
