//! Transactional step executor.
//!
//! Runs one planned action and the matching saga state update in a single
//! store transaction, retrying transient store failures.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::machine::Plan;
use crate::state::{Position, SagaStatus};
use crate::step::Action;
use crate::store::{SagaStore, StepTransaction};

/// Bounds for retrying transient transaction failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// No new attempt starts once this much time has passed since the first.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Result of executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The side effect and the state update were committed.
    Applied(Position),
    /// The saga had already moved on; nothing was written.
    Stale { expected: Position, actual: Position },
}

/// Executes planned actions against a [`SagaStore`].
pub struct TransactionalStepExecutor<St> {
    store: St,
    retry: RetryPolicy,
}

impl<St: SagaStore> TransactionalStepExecutor<St> {
    pub fn new(store: St) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Executes `plan` for `saga` atomically.
    ///
    /// Transient failures are retried with exponential backoff; the caller
    /// sees either the final outcome, the first permanent error, or
    /// `RetriesExhausted` wrapping the last transient error.
    #[tracing::instrument(
        skip(self, saga, plan),
        fields(order_id = %saga.order_id, action = %plan.action, from = %plan.from)
    )]
    pub async fn execute(&self, saga: &SagaInstance, plan: &Plan) -> Result<ExecuteOutcome> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(saga, plan).await {
                Ok(outcome) => {
                    metrics::histogram!("saga_tx_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    record_outcome(plan, &outcome);
                    return Ok(outcome);
                }
                Err(err) if err.is_transient() => {
                    let backoff = self.retry.backoff(attempt);
                    if attempt >= self.retry.max_attempts
                        || started.elapsed() + backoff > self.retry.deadline
                    {
                        tracing::warn!(attempt, error = %err, "giving up on transaction");
                        return Err(SagaError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    metrics::counter!("saga_tx_retries_total").increment(1);
                    tracing::debug!(attempt, ?backoff, error = %err, "retrying transaction");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, saga: &SagaInstance, plan: &Plan) -> Result<ExecuteOutcome> {
        let mut tx = self.store.begin().await?;

        let actual = tx
            .lock_saga(saga.order_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga.order_id))?;
        if actual != plan.from {
            return Ok(ExecuteOutcome::Stale {
                expected: plan.from,
                actual,
            });
        }

        apply_action(&mut tx, saga, plan.action).await?;
        tx.update_saga(saga.order_id, plan.to).await?;
        tx.commit().await?;

        Ok(ExecuteOutcome::Applied(plan.to))
    }
}

/// Performs the side-effect write of one action.
async fn apply_action<T: StepTransaction>(
    tx: &mut T,
    saga: &SagaInstance,
    action: Action,
) -> Result<()> {
    let order_id = saga.order_id;
    match action {
        Action::CreateOrder => tx.insert_order(order_id).await,
        Action::CancelOrder => tx.cancel_order(order_id).await,
        Action::CreatePayment => tx.insert_payment(order_id, saga.payment).await,
        Action::CancelPayment => tx.cancel_payment(order_id).await,
        Action::CreateReservations => {
            for item in &saga.products {
                tx.insert_reservation(order_id, item).await?;
            }
            Ok(())
        }
        Action::DeleteReservations => tx.delete_reservations(order_id).await,
        Action::CreateShipment => tx.insert_shipment(order_id).await,
        Action::CancelShipment => tx.cancel_shipment(order_id).await,
        Action::CancelSaga => Ok(()),
    }
}

fn record_outcome(plan: &Plan, outcome: &ExecuteOutcome) {
    match outcome {
        ExecuteOutcome::Applied(position) => {
            metrics::counter!("saga_actions_applied_total", "action" => plan.action.as_str())
                .increment(1);
            match position.status {
                SagaStatus::Finished => {
                    metrics::counter!("sagas_finished_total").increment(1);
                    tracing::info!(to = %position, "saga finished");
                }
                SagaStatus::Cancelled => {
                    metrics::counter!("sagas_cancelled_total").increment(1);
                    tracing::info!(to = %position, "saga cancelled");
                }
                _ => tracing::debug!(to = %position, "step applied"),
            }
        }
        ExecuteOutcome::Stale { expected, actual } => {
            metrics::counter!("saga_events_stale_total").increment(1);
            tracing::debug!(%expected, %actual, "skipping stale event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Failures, LineItem, NewSaga};
    use crate::machine::{Decision, decide};
    use crate::store::{InMemorySagaStore, RecordStatus};
    use crate::step::Step;
    use common::OrderId;

    fn new_saga(failures: Failures) -> SagaInstance {
        SagaInstance::submitted(
            NewSaga::new(
                OrderId::new(),
                15.0,
                vec![LineItem::new("a", 1), LineItem::new("b", 4)],
            )
            .with_failures(failures),
        )
    }

    fn plan_for(saga: &SagaInstance) -> Plan {
        match decide(saga) {
            Decision::Run(plan) => plan,
            other => panic!("expected a plan, got {other:?}"),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_applies_side_effect_and_state_together() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        store.insert_saga(&saga).await.unwrap();
        let executor = TransactionalStepExecutor::new(store.clone());

        let plan = plan_for(&saga);
        let outcome = executor.execute(&saga, &plan).await.unwrap();
        assert_eq!(outcome, ExecuteOutcome::Applied(plan.to));

        let stored = store.get_saga(saga.order_id).await.unwrap().unwrap();
        assert_eq!(stored.position(), plan.to);
        let effects = store.side_effects(saga.order_id).await.unwrap();
        assert_eq!(effects.order, Some(RecordStatus::Active));
    }

    #[tokio::test]
    async fn test_stale_plan_writes_nothing() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        store.insert_saga(&saga).await.unwrap();
        let executor = TransactionalStepExecutor::new(store.clone());

        let plan = plan_for(&saga);
        executor.execute(&saga, &plan).await.unwrap();
        let second = executor.execute(&saga, &plan).await.unwrap();

        assert_eq!(
            second,
            ExecuteOutcome::Stale {
                expected: Position::initial(),
                actual: Position::new(Step::Payment, SagaStatus::InProgress),
            }
        );
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_saga_is_not_found() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        let executor = TransactionalStepExecutor::new(store);

        let err = executor.execute(&saga, &plan_for(&saga)).await.unwrap_err();
        assert!(matches!(err, SagaError::SagaNotFound(id) if id == saga.order_id));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        store.insert_saga(&saga).await.unwrap();
        store.fail_next_commits(2);
        let executor = TransactionalStepExecutor::new(store.clone()).with_retry(fast_retry(3));

        let plan = plan_for(&saga);
        let outcome = executor.execute(&saga, &plan).await.unwrap();
        assert_eq!(outcome, ExecuteOutcome::Applied(plan.to));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        store.insert_saga(&saga).await.unwrap();
        store.fail_next_commits(10);
        let executor = TransactionalStepExecutor::new(store.clone()).with_retry(fast_retry(3));

        let err = executor
            .execute(&saga, &plan_for(&saga))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::RetriesExhausted { attempts: 3, .. }));
        let stored = store.get_saga(saga.order_id).await.unwrap().unwrap();
        assert_eq!(stored.position(), Position::initial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        store.insert_saga(&saga).await.unwrap();
        store.fail_next_commits(100);
        let executor = TransactionalStepExecutor::new(store).with_retry(RetryPolicy {
            max_attempts: 100,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            deadline: Duration::from_millis(350),
        });

        let err = executor
            .execute(&saga, &plan_for(&saga))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::RetriesExhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none());
        store.insert_saga(&saga).await.unwrap();
        store.reject_next_commits(1);
        let executor = TransactionalStepExecutor::new(store.clone()).with_retry(fast_retry(5));

        let err = executor
            .execute(&saga, &plan_for(&saga))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::StoreRejected(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_reservations_created_and_deleted() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none().with(Step::Shipment));
        store.insert_saga(&saga).await.unwrap();
        let executor = TransactionalStepExecutor::new(store.clone());

        let mut current = saga.clone();
        for _ in 0..3 {
            let plan = plan_for(&current);
            executor.execute(&current, &plan).await.unwrap();
            current = current.advanced_to(plan.to);
        }
        let effects = store.side_effects(saga.order_id).await.unwrap();
        assert_eq!(effects.reservations.len(), 2);

        let plan = plan_for(&current);
        assert_eq!(plan.action, Action::DeleteReservations);
        executor.execute(&current, &plan).await.unwrap();
        let effects = store.side_effects(saga.order_id).await.unwrap();
        assert!(effects.reservations.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_saga_touches_no_side_effect() {
        let store = InMemorySagaStore::new();
        let saga = new_saga(Failures::none().with(Step::Order));
        store.insert_saga(&saga).await.unwrap();
        let executor = TransactionalStepExecutor::new(store.clone());

        let plan = plan_for(&saga);
        assert_eq!(plan.action, Action::CancelSaga);
        executor.execute(&saga, &plan).await.unwrap();

        let stored = store.get_saga(saga.order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SagaStatus::Cancelled);
        assert_eq!(
            store.side_effects(saga.order_id).await.unwrap(),
            crate::store::SideEffects::default()
        );
    }
}
