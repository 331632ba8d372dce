//! Saga change events as carried on the event stream.
//!
//! Every committed change to a saga row is published as a
//! [`SagaEventPayload`]. `products` and `failures` travel as raw JSON and
//! are decoded independently, so a malformed section is reported by name.

use common::OrderId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SagaError};
use crate::instance::{Failures, LineItem, SagaInstance};
use crate::state::Position;

/// The wire form of a saga row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEventPayload {
    pub order_id: OrderId,
    pub payment: f64,
    #[serde(default)]
    pub products: Value,
    pub step: String,
    pub status: String,
    #[serde(default)]
    pub failures: Value,
}

impl SagaEventPayload {
    pub fn from_instance(instance: &SagaInstance) -> Result<Self> {
        Ok(Self {
            order_id: instance.order_id,
            payment: instance.payment,
            products: serde_json::to_value(&instance.products)?,
            step: instance.step.as_str().to_string(),
            status: instance.status.as_str().to_string(),
            failures: serde_json::to_value(instance.failures)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Turns the payload into a typed instance.
    pub fn into_instance(self) -> Result<SagaInstance> {
        let position =
            Position::from_names(&self.step, &self.status).ok_or(SagaError::InvalidState {
                step: self.step,
                status: self.status,
            })?;

        let products: Vec<LineItem> = decode_section(self.products, "products")?;
        let failures: Failures = decode_section(self.failures, "failures")?;

        Ok(SagaInstance {
            order_id: self.order_id,
            payment: self.payment,
            products,
            step: position.step,
            status: position.status,
            failures,
        })
    }
}

/// A missing or null section decodes to its default.
fn decode_section<T>(raw: Value, field: &'static str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw).map_err(|source| SagaError::Decode { field, source })
}

/// Decodes a stream message payload into a saga instance.
pub fn decode(bytes: &[u8]) -> Result<SagaInstance> {
    let payload: SagaEventPayload = serde_json::from_slice(bytes).map_err(|source| {
        SagaError::Decode {
            field: "payload",
            source,
        }
    })?;
    payload.into_instance()
}

/// Encodes a saga instance as a stream message payload.
pub fn encode(instance: &SagaInstance) -> Result<Vec<u8>> {
    SagaEventPayload::from_instance(instance)?.encode()
}
