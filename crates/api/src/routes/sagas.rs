//! Saga submission and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::OrderId;
use saga::{ConsumerStats, NewSaga, SagaInstance, SagaReport, SagaService, SagaStore};
use serde::Serialize;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<St> {
    pub service: SagaService<St>,
    pub stats: Arc<ConsumerStats>,
    pub consumer_group: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaSubmittedResponse {
    pub order_id: String,
    pub step: String,
    pub status: String,
}

impl From<&SagaInstance> for SagaSubmittedResponse {
    fn from(saga: &SagaInstance) -> Self {
        Self {
            order_id: saga.order_id.to_string(),
            step: saga.step.to_string(),
            status: saga.status.to_string(),
        }
    }
}

// -- Handlers --

/// POST /sagas: persist a new saga; the coordinator picks it up from the change feed.
#[tracing::instrument(skip(state, body))]
pub async fn submit<St: SagaStore + 'static>(
    State(state): State<Arc<AppState<St>>>,
    body: Result<Json<NewSaga>, JsonRejection>,
) -> Result<(StatusCode, Json<SagaSubmittedResponse>), ApiError> {
    let Json(new_saga) = body?;
    let saga = state.service.submit(new_saga).await?;
    Ok((StatusCode::CREATED, Json(SagaSubmittedResponse::from(&saga))))
}

/// GET /sagas/{order_id}: the saga record and the side-effect rows it owns.
#[tracing::instrument(skip(state))]
pub async fn get<St: SagaStore + 'static>(
    State(state): State<Arc<AppState<St>>>,
    Path(order_id): Path<String>,
) -> Result<Json<SagaReport>, ApiError> {
    let order_id: OrderId = order_id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;

    state
        .service
        .get(order_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Saga not found: {order_id}")))
}
