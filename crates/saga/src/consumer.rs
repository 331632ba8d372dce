//! The event consumer loop: fetch, decode, decide, execute, commit.
//!
//! A message's cursor is committed only once its event has been fully
//! handled (applied, stale, or addressed to a finished saga). Anything
//! else leaves the cursor where it is and the stream hands the message
//! out again.

use std::sync::Arc;
use std::time::Duration;

use common::OrderId;
use event_stream::{ConsumerGroup, EventStream, Offset, Partition, StreamMessage};
use futures_util::future::try_join_all;
use tokio::sync::watch;

use crate::error::{Result, SagaError};
use crate::event;
use crate::executor::{ExecuteOutcome, TransactionalStepExecutor};
use crate::machine::{Decision, decide};
use crate::state::Position;
use crate::stats::ConsumerStats;
use crate::store::SagaStore;

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: ConsumerGroup,
    /// Pause after the stream itself fails before fetching again.
    pub fetch_error_pause: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: ConsumerGroup::new("saga-coordinator"),
            fetch_error_pause: Duration::from_secs(1),
        }
    }
}

/// What happened to one fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Applied {
        order_id: OrderId,
        position: Position,
    },
    Stale {
        order_id: OrderId,
        expected: Position,
        actual: Position,
    },
    AlreadyTerminal {
        order_id: OrderId,
        position: Position,
    },
    /// The payload could not be decoded; the cursor was not committed.
    DecodeFailed { partition: Partition, offset: Offset },
}

impl PollOutcome {
    /// Returns true if the message's cursor was committed.
    pub fn is_committed(&self) -> bool {
        !matches!(self, PollOutcome::DecodeFailed { .. })
    }
}

/// Drives sagas from events on the stream.
pub struct SagaConsumer<St> {
    stream: Arc<dyn EventStream>,
    executor: TransactionalStepExecutor<St>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl<St: SagaStore> SagaConsumer<St> {
    pub fn new(
        stream: Arc<dyn EventStream>,
        executor: TransactionalStepExecutor<St>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            stream,
            executor,
            config,
            stats: Arc::new(ConsumerStats::new()),
        }
    }

    /// Reports into a shared stats collector instead of a private one.
    pub fn with_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.config.group
    }

    pub fn executor(&self) -> &TransactionalStepExecutor<St> {
        &self.executor
    }

    /// Attaches the consumer group to every partition.
    ///
    /// Pins the starting offset of a `Latest` group to the current head, so
    /// events published after this call are not skipped.
    pub async fn attach_all(&self) -> Result<()> {
        for partition in Partition::all(self.stream.partition_count()) {
            let offset = self.stream.attach(&self.config.group, partition).await?;
            tracing::debug!(%partition, %offset, group = %self.config.group, "attached");
        }
        Ok(())
    }

    /// Waits for the next message on `partition` and handles it.
    pub async fn poll_once(&self, partition: Partition) -> Result<PollOutcome> {
        let message = self.fetch(partition).await?;
        self.deliver(&message).await
    }

    async fn fetch(&self, partition: Partition) -> Result<StreamMessage> {
        match self.stream.fetch(&self.config.group, partition).await {
            Ok(message) => {
                self.stats.record_fetched();
                metrics::counter!("saga_events_fetched_total").increment(1);
                Ok(message)
            }
            Err(err) => {
                self.stats.record_fetch_failure();
                Err(err.into())
            }
        }
    }

    /// Handles one fetched message and commits its cursor on success.
    #[tracing::instrument(
        skip(self, message),
        fields(partition = %message.partition, offset = %message.offset)
    )]
    pub async fn deliver(&self, message: &StreamMessage) -> Result<PollOutcome> {
        let saga = match event::decode(&message.payload) {
            Ok(saga) => saga,
            Err(err @ SagaError::InvalidState { .. }) => {
                self.stats.record_decode_failure();
                metrics::counter!("saga_decode_failures_total").increment(1);
                tracing::error!(key = %message.key, error = %err, "saga in unknown state, needs operator attention");
                return Err(err);
            }
            Err(err) => {
                self.stats.record_decode_failure();
                metrics::counter!("saga_decode_failures_total").increment(1);
                tracing::warn!(key = %message.key, error = %err, "failed to decode saga event");
                return Ok(PollOutcome::DecodeFailed {
                    partition: message.partition,
                    offset: message.offset,
                });
            }
        };

        let order_id = saga.order_id;
        let outcome = match decide(&saga) {
            Decision::AlreadyTerminal(position) => {
                self.stats.record_terminal();
                tracing::debug!(%order_id, %position, "saga already terminal");
                PollOutcome::AlreadyTerminal { order_id, position }
            }
            Decision::Run(plan) => match self.executor.execute(&saga, &plan).await {
                Ok(ExecuteOutcome::Applied(position)) => {
                    self.stats.record_applied();
                    PollOutcome::Applied { order_id, position }
                }
                Ok(ExecuteOutcome::Stale { expected, actual }) => {
                    self.stats.record_stale();
                    PollOutcome::Stale {
                        order_id,
                        expected,
                        actual,
                    }
                }
                Err(err) => {
                    self.stats.record_execute_failure();
                    metrics::counter!("saga_execute_failures_total").increment(1);
                    tracing::warn!(%order_id, action = %plan.action, error = %err, "failed to execute step");
                    return Err(err);
                }
            },
        };

        self.stream.commit(&self.config.group, message).await?;
        Ok(outcome)
    }

    /// Polls `partition` until `shutdown` turns true.
    ///
    /// Shutdown is observed only while waiting for a message or pausing
    /// after a stream failure, so an event that is already being executed
    /// always runs to completion. Stream failures never end the loop.
    #[tracing::instrument(skip(self, shutdown), fields(group = %self.config.group))]
    pub async fn run(&self, partition: Partition, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                tracing::info!("consumer stopped");
                return Ok(());
            }
            match self.stream.attach(&self.config.group, partition).await {
                Ok(offset) => {
                    tracing::info!(%offset, "consumer started");
                    break;
                }
                Err(err) => {
                    self.stats.record_fetch_failure();
                    tracing::warn!(error = %err, "failed to attach to partition, pausing");
                    if !self.pause(&mut shutdown).await {
                        tracing::info!("consumer stopped");
                        return Ok(());
                    }
                }
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                fetched = self.fetch(partition) => fetched,
            };

            let result = match fetched {
                Ok(message) => self.deliver(&message).await,
                Err(err) => Err(err),
            };

            if let Err(SagaError::Stream(err)) = result {
                tracing::warn!(error = %err, "event stream failure, pausing");
                if !self.pause(&mut shutdown).await {
                    break;
                }
            }
        }

        tracing::info!("consumer stopped");
        Ok(())
    }

    /// Sleeps for `fetch_error_pause`. Returns false if shutdown was
    /// requested in the meantime.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(self.config.fetch_error_pause) => true,
        }
    }

    /// Runs one worker per partition until `shutdown` turns true.
    pub async fn run_all(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let workers = Partition::all(self.stream.partition_count())
            .map(|partition| self.run(partition, shutdown.clone()));
        try_join_all(workers).await?;
        Ok(())
    }
}
