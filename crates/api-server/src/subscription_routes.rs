//! Subscription API Routes
//!
//! Subscriber registration and subscription management.

use advisory_core::{Interval, Period, State as AdvisoryState, SubscriberId, Subscription, SubscriptionId};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subscription_store::{SubscribeRequest, SubscriptionFilter};

use crate::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct SubscriberQuery {
    pub subscriber_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub subscriber_id: SubscriberId,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub subscriber_id: SubscriberId,
    pub ticker: String,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsRequest {
    pub subscriber_id: SubscriberId,
    pub subscription_id: SubscriptionId,
    pub active: bool,
}

/// A subscription as seen by one of its members.
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub id: SubscriptionId,
    pub ticker: String,
    pub name: String,
    pub period: Period,
    pub interval: Interval,
    pub state: AdvisoryState,
    pub notifications_active: bool,
}

impl SubscriptionView {
    fn for_member(subscription: Subscription, subscriber_id: &SubscriberId) -> Self {
        let notifications_active = subscription
            .members
            .iter()
            .any(|m| &m.subscriber_id == subscriber_id && m.notifications_active);
        Self {
            id: subscription.id,
            ticker: subscription.instrument.ticker,
            name: subscription.instrument.name,
            period: subscription.period,
            interval: subscription.interval,
            state: subscription.state,
            notifications_active,
        }
    }
}

pub fn subscription_routes() -> Router<AppState> {
    Router::new()
        .route("/api/subscribers", post(register_subscriber))
        .route("/api/subscriptions", get(list_subscriptions).post(subscribe))
        .route("/api/subscriptions/unsubscribe", post(unsubscribe))
        .route("/api/subscriptions/notifications", post(set_notifications))
}

async fn register_subscriber(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if req.subscriber_id.as_str().trim().is_empty() {
        return Err(AppError::BadRequest("subscriber_id must not be empty".to_string()));
    }
    state.store.register_subscriber(&req.subscriber_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "subscriber_id": req.subscriber_id })),
    ))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<SubscriberQuery>,
) -> Result<Json<Vec<SubscriptionView>>, AppError> {
    let subscriber_id = query
        .subscriber_id
        .filter(|id| !id.trim().is_empty())
        .map(SubscriberId::new)
        .ok_or_else(|| AppError::BadRequest("subscriber_id is required".to_string()))?;

    let subscriptions = state
        .store
        .list_subscriptions(&SubscriptionFilter::subscriber(subscriber_id.clone()))
        .await?;

    Ok(Json(
        subscriptions
            .into_iter()
            .map(|s| SubscriptionView::for_member(s, &subscriber_id))
            .collect(),
    ))
}

async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscriptionView>), AppError> {
    let subscription = state.store.subscribe(&req).await?;
    tracing::info!("{} subscribed to {}", req.subscriber_id, subscription.ticker());
    Ok((
        StatusCode::CREATED,
        Json(SubscriptionView::for_member(subscription, &req.subscriber_id)),
    ))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Json(req): Json<UnsubscribeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.unsubscribe(&req.subscriber_id, &req.ticker).await?;
    tracing::info!("{} unsubscribed from {}", req.subscriber_id, req.ticker);
    Ok(Json(json!({ "message": "unsubscribed" })))
}

async fn set_notifications(
    State(state): State<AppState>,
    Json(req): Json<NotificationsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .store
        .set_notifications(&req.subscriber_id, req.subscription_id, req.active)
        .await?;
    Ok(Json(json!({
        "subscription_id": req.subscription_id,
        "notifications_active": req.active,
    })))
}
