//! Consumer statistics endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::StatsSnapshot;
use serde::Serialize;

use super::sagas::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    pub consumer_group: String,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

/// GET /stats: event counters of this process's consumer.
pub async fn get<St: Send + Sync + 'static>(
    State(state): State<Arc<AppState<St>>>,
) -> Json<StatsResponse> {
    Json(StatsResponse {
        consumer_group: state.consumer_group.clone(),
        stats: state.stats.snapshot(),
    })
}
