//! Trigger endpoints
//!
//! Batch re-evaluation of every subscription, or an on-demand advisory
//! run for a single subscriber.

use advisory_core::SubscriberId;
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use trigger_controller::TriggerSummary;

use crate::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct AnalysisQuery {
    pub subscriber_id: Option<String>,
}

pub fn analysis_routes() -> Router<AppState> {
    Router::new().route("/api/analysis", get(run_analysis))
}

async fn run_analysis(
    State(state): State<AppState>,
    Query(query): Query<AnalysisQuery>,
) -> Result<Json<TriggerSummary>, AppError> {
    let subscriber = query
        .subscriber_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let summary = match subscriber {
        Some(id) => {
            let subscriber_id = SubscriberId::new(id);
            tracing::info!("On-demand analysis requested by {}", subscriber_id);
            state.controller.run_for_subscriber(&subscriber_id).await?
        }
        None => state.controller.run_batch().await?,
    };

    Ok(Json(summary))
}
