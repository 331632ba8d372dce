use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use common::OrderId;
use event_stream::{EventStream, InMemoryEventStream};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Result, SagaError};
use crate::event;
use crate::instance::{LineItem, SagaInstance};
use crate::state::Position;
use crate::store::{PaymentRecord, RecordStatus, SagaStore, SideEffects, StepTransaction};

#[derive(Debug, Clone, Default)]
struct Tables {
    sagas: HashMap<OrderId, SagaInstance>,
    orders: HashMap<OrderId, RecordStatus>,
    payments: HashMap<OrderId, PaymentRecord>,
    reservations: HashMap<OrderId, BTreeMap<String, i32>>,
    shipments: HashMap<OrderId, RecordStatus>,
}

impl Tables {
    fn require_saga(&self, order_id: OrderId) -> Result<()> {
        if self.sagas.contains_key(&order_id) {
            Ok(())
        } else {
            Err(SagaError::SagaNotFound(order_id))
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    transient: AtomicU32,
    rejected: AtomicU32,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory saga store implementation for testing.
///
/// Transactions are serialized by a single lock and stage their writes on a
/// copy of the tables, so a dropped transaction leaves no trace. With a
/// change feed attached, every committed saga row is published to the
/// stream the way the PostgreSQL trigger does.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
    commits: Arc<AtomicU64>,
    feed: Option<InMemoryEventStream>,
}

impl InMemorySagaStore {
    /// Creates a new empty store without a change feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes every committed saga change to `stream`.
    pub fn with_change_feed(mut self, stream: InMemoryEventStream) -> Self {
        self.feed = Some(stream);
        self
    }

    /// Makes the next `n` commits fail with a transient conflict.
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.transient.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` commits fail permanently.
    pub fn reject_next_commits(&self, n: u32) {
        self.faults.rejected.store(n, Ordering::SeqCst);
    }

    /// Returns the number of successful step transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

async fn publish(feed: &Option<InMemoryEventStream>, saga: &SagaInstance) -> Result<()> {
    if let Some(stream) = feed {
        stream
            .publish(&saga.order_id.to_string(), event::encode(saga)?)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    type Tx = InMemoryStepTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = (*guard).clone();
        Ok(InMemoryStepTransaction {
            guard,
            staged,
            changed: Vec::new(),
            faults: self.faults.clone(),
            commits: self.commits.clone(),
            feed: self.feed.clone(),
        })
    }

    async fn insert_saga(&self, saga: &SagaInstance) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.sagas.contains_key(&saga.order_id) {
            return Err(SagaError::AlreadyExists(saga.order_id));
        }
        tables.sagas.insert(saga.order_id, saga.clone());
        publish(&self.feed, saga).await
    }

    async fn get_saga(&self, order_id: OrderId) -> Result<Option<SagaInstance>> {
        Ok(self.tables.lock().await.sagas.get(&order_id).cloned())
    }

    async fn side_effects(&self, order_id: OrderId) -> Result<SideEffects> {
        let tables = self.tables.lock().await;
        Ok(SideEffects {
            order: tables.orders.get(&order_id).copied(),
            payment: tables.payments.get(&order_id).copied(),
            reservations: tables
                .reservations
                .get(&order_id)
                .map(|items| {
                    items
                        .iter()
                        .map(|(id, quantity)| LineItem::new(id.clone(), *quantity))
                        .collect()
                })
                .unwrap_or_default(),
            shipment: tables.shipments.get(&order_id).copied(),
        })
    }
}

/// A staged in-memory transaction holding the store lock.
pub struct InMemoryStepTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
    changed: Vec<OrderId>,
    faults: Arc<Faults>,
    commits: Arc<AtomicU64>,
    feed: Option<InMemoryEventStream>,
}

fn cancel(records: &mut HashMap<OrderId, RecordStatus>, order_id: OrderId) {
    if let Some(status) = records.get_mut(&order_id) {
        *status = RecordStatus::Cancelled;
    }
}

#[async_trait]
impl StepTransaction for InMemoryStepTransaction {
    async fn lock_saga(&mut self, order_id: OrderId) -> Result<Option<Position>> {
        Ok(self.staged.sagas.get(&order_id).map(SagaInstance::position))
    }

    async fn update_saga(&mut self, order_id: OrderId, position: Position) -> Result<()> {
        let saga = self
            .staged
            .sagas
            .get_mut(&order_id)
            .ok_or(SagaError::SagaNotFound(order_id))?;
        saga.step = position.step;
        saga.status = position.status;
        if !self.changed.contains(&order_id) {
            self.changed.push(order_id);
        }
        Ok(())
    }

    async fn insert_order(&mut self, order_id: OrderId) -> Result<()> {
        self.staged.require_saga(order_id)?;
        self.staged
            .orders
            .entry(order_id)
            .or_insert(RecordStatus::Active);
        Ok(())
    }

    async fn cancel_order(&mut self, order_id: OrderId) -> Result<()> {
        cancel(&mut self.staged.orders, order_id);
        Ok(())
    }

    async fn insert_payment(&mut self, order_id: OrderId, amount: f64) -> Result<()> {
        self.staged.require_saga(order_id)?;
        self.staged
            .payments
            .entry(order_id)
            .or_insert(PaymentRecord {
                amount,
                status: RecordStatus::Active,
            });
        Ok(())
    }

    async fn cancel_payment(&mut self, order_id: OrderId) -> Result<()> {
        if let Some(payment) = self.staged.payments.get_mut(&order_id) {
            payment.status = RecordStatus::Cancelled;
        }
        Ok(())
    }

    async fn insert_reservation(&mut self, order_id: OrderId, item: &LineItem) -> Result<()> {
        self.staged.require_saga(order_id)?;
        self.staged
            .reservations
            .entry(order_id)
            .or_default()
            .entry(item.id.clone())
            .or_insert(item.quantity);
        Ok(())
    }

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<()> {
        self.staged.reservations.remove(&order_id);
        Ok(())
    }

    async fn insert_shipment(&mut self, order_id: OrderId) -> Result<()> {
        self.staged.require_saga(order_id)?;
        self.staged
            .shipments
            .entry(order_id)
            .or_insert(RecordStatus::Active);
        Ok(())
    }

    async fn cancel_shipment(&mut self, order_id: OrderId) -> Result<()> {
        cancel(&mut self.staged.shipments, order_id);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let Self {
            mut guard,
            staged,
            changed,
            faults,
            commits,
            feed,
        } = self;

        if Faults::take(&faults.transient) {
            return Err(SagaError::TransientConflict(
                "injected serialization failure".to_string(),
            ));
        }
        if Faults::take(&faults.rejected) {
            return Err(SagaError::StoreRejected(
                "injected permanent failure".to_string(),
            ));
        }

        *guard = staged;
        commits.fetch_add(1, Ordering::SeqCst);

        // Published while the lock is held so feed order matches commit order.
        for order_id in changed {
            if let Some(saga) = guard.sagas.get(&order_id) {
                publish(&feed, saga).await?;
            }
        }
        Ok(())
    }
}
