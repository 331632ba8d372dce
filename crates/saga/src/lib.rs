//! Saga coordinator for the order → payment → reservation → shipment
//! business transaction.
//!
//! Each saga row change is published to an event stream. The consumer loop
//! reads those events, lets the state machine pick the single legal next
//! action, and runs it together with the saga's state update in one store
//! transaction. A permanent failure at any step unwinds the completed steps
//! with their compensating actions, in reverse order.
//!
//! Delivery is at-least-once; a stale or repeated event is detected by the
//! state guard inside the transaction and skipped.

pub mod consumer;
pub mod error;
pub mod event;
pub mod executor;
pub mod instance;
pub mod machine;
pub mod service;
pub mod state;
pub mod stats;
pub mod step;
pub mod store;

pub use consumer::{ConsumerConfig, PollOutcome, SagaConsumer};
pub use error::{Result, SagaError};
pub use event::SagaEventPayload;
pub use executor::{ExecuteOutcome, RetryPolicy, TransactionalStepExecutor};
pub use instance::{Failures, LineItem, NewSaga, SagaInstance};
pub use machine::{Decision, Plan, decide, target_of};
pub use service::{SagaReport, SagaService};
pub use state::{Position, SagaStatus};
pub use stats::{ConsumerStats, StatsSnapshot};
pub use step::{Action, Step, StepActions, actions_for};
pub use store::{
    InMemorySagaStore, PaymentRecord, PostgresSagaStore, RecordStatus, SagaStore, SideEffects,
    StepTransaction,
};
