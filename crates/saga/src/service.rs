//! Saga submission and lookup.

use common::OrderId;
use serde::Serialize;

use crate::error::Result;
use crate::instance::{NewSaga, SagaInstance};
use crate::store::{SagaStore, SideEffects};

/// A saga together with the side-effect rows it currently owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaReport {
    pub saga: SagaInstance,
    pub side_effects: SideEffects,
}

/// Entry point for clients: submits sagas and reports on them.
///
/// Submitting only persists the saga; the consumer loop picks it up from
/// the store's change feed.
#[derive(Clone)]
pub struct SagaService<St> {
    store: St,
}

impl<St: SagaStore> SagaService<St> {
    pub fn new(store: St) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Validates and persists a new saga at `order/in_progress`.
    #[tracing::instrument(skip(self, saga), fields(order_id = %saga.order_id))]
    pub async fn submit(&self, saga: NewSaga) -> Result<SagaInstance> {
        saga.validate()?;
        let instance = SagaInstance::submitted(saga);
        self.store.insert_saga(&instance).await?;

        metrics::counter!("sagas_submitted_total").increment(1);
        tracing::info!(products = instance.products.len(), "saga submitted");
        Ok(instance)
    }

    /// Loads a saga and its side effects, or None if it was never submitted.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, order_id: OrderId) -> Result<Option<SagaReport>> {
        let Some(saga) = self.store.get_saga(order_id).await? else {
            return Ok(None);
        };
        let side_effects = self.store.side_effects(order_id).await?;
        Ok(Some(SagaReport { saga, side_effects }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SagaError;
    use crate::instance::LineItem;
    use crate::state::Position;
    use crate::store::InMemorySagaStore;

    #[tokio::test]
    async fn test_submit_persists_initial_saga() {
        let service = SagaService::new(InMemorySagaStore::new());
        let saga = NewSaga::new(OrderId::new(), 12.0, vec![LineItem::new("a", 2)]);

        let instance = service.submit(saga.clone()).await.unwrap();
        assert_eq!(instance.position(), Position::initial());

        let report = service.get(saga.order_id).await.unwrap().unwrap();
        assert_eq!(report.saga, instance);
        assert_eq!(report.side_effects, SideEffects::default());
    }

    #[tokio::test]
    async fn test_submit_rejects_reused_order_id() {
        let service = SagaService::new(InMemorySagaStore::new());
        let saga = NewSaga::new(OrderId::new(), 12.0, vec![]);
        service.submit(saga.clone()).await.unwrap();

        let err = service.submit(saga).await.unwrap_err();
        assert!(matches!(err, SagaError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_submit_validates() {
        let service = SagaService::new(InMemorySagaStore::new());
        let saga = NewSaga::new(OrderId::new(), -5.0, vec![]);

        let err = service.submit(saga).await.unwrap_err();
        assert!(matches!(err, SagaError::InvalidSaga(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_repeated_product_line() {
        let service = SagaService::new(InMemorySagaStore::new());
        let saga = NewSaga::new(
            OrderId::new(),
            5.0,
            vec![LineItem::new("a", 1), LineItem::new("a", 2)],
        );

        let err = service.submit(saga.clone()).await.unwrap_err();
        assert!(matches!(err, SagaError::InvalidSaga(_)));
        assert!(service.get(saga.order_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_unknown() {
        let service = SagaService::new(InMemorySagaStore::new());
        assert!(service.get(OrderId::new()).await.unwrap().is_none());
    }
}
