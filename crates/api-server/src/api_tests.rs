use std::sync::{Arc, Mutex};

use advisory_core::{
    AdvisoryError, Bar, DeliveryError, Interval, MessagingSink, Period, PriceSource, SubscriberId,
};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use notification_service::NotificationDispatcher;
use serde_json::{json, Value};
use state_classifier::RuleTable;
use subscription_store::{InMemoryStore, SubscriptionStore};
use technical_analysis::IndicatorEngine;
use tower::ServiceExt;
use trigger_controller::{TriggerConfig, TriggerController};

use crate::auth::ApiKeys;
use crate::{app, AppState};

/// Every ticker falls steadily: RSI 0, classified Strong Buy.
struct FallingSource;

#[async_trait]
impl PriceSource for FallingSource {
    async fn fetch_history(
        &self,
        _ticker: &str,
        _period: &Period,
        _interval: &Interval,
    ) -> Result<Vec<Bar>, AdvisoryError> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Ok((0..60)
            .map(|i| {
                let close = 200.0 - i as f64;
                Bar {
                    timestamp: start + chrono::Duration::days(i),
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 1000.0,
                }
            })
            .collect())
    }

    fn name(&self) -> &str {
        "falling"
    }
}

#[derive(Default)]
struct RecordingSink {
    recipients: Mutex<Vec<String>>,
}

#[async_trait]
impl MessagingSink for RecordingSink {
    async fn send(
        &self,
        recipient: &SubscriberId,
        _text: &str,
        _image: Option<&[u8]>,
    ) -> Result<(), DeliveryError> {
        self.recipients.lock().unwrap().push(recipient.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    sink: Arc<RecordingSink>,
}

fn test_app(keys: &[&str]) -> TestApp {
    let store = Arc::new(InMemoryStore::new(RuleTable::standard(), 2));
    let sink = Arc::new(RecordingSink::default());
    let dyn_store: Arc<dyn SubscriptionStore> = store.clone();
    let controller = TriggerController::new(
        Arc::clone(&dyn_store),
        Arc::new(FallingSource),
        Arc::new(NotificationDispatcher::new(sink.clone())),
        IndicatorEngine::default(),
        TriggerConfig::default(),
    );
    let state = AppState {
        store: dyn_store,
        controller: Arc::new(controller),
        api_keys: Arc::new(ApiKeys::new(keys.iter().copied())),
    };
    TestApp {
        router: app(state),
        store,
        sink,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn register_and_subscribe(app: &TestApp, subscriber: &str, ticker: &str) -> Value {
    let (status, _) = send(
        &app.router,
        post("/api/subscribers", json!({ "subscriber_id": subscriber })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app.router,
        post(
            "/api/subscriptions",
            json!({ "subscriber_id": subscriber, "ticker": ticker }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn test_health() {
    let app = test_app(&["secret-key-123"]);
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_batch_with_no_subscriptions() {
    let app = test_app(&[]);
    let (status, body) = send(&app.router, get("/api/analysis")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "No active subscriptions");
    assert_eq!(body["mode"], "batch");
}

#[tokio::test]
async fn test_subscribe_and_list() {
    let app = test_app(&[]);
    let created = register_and_subscribe(&app, "42", "aapl").await;
    assert_eq!(created["ticker"], "AAPL");
    assert_eq!(created["state"]["name"], "Hold");
    assert_eq!(created["notifications_active"], true);

    let (status, body) = send(&app.router, get("/api/subscriptions?subscriber_id=42")).await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["ticker"], "AAPL");

    let (status, body) = send(&app.router, get("/api/subscriptions?subscriber_id=7")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_requires_subscriber_id() {
    let app = test_app(&[]);
    let (status, body) = send(&app.router, get("/api/subscriptions")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("subscriber_id"));
}

#[tokio::test]
async fn test_validation_errors_are_bad_requests() {
    let app = test_app(&[]);

    // not registered
    let (status, body) = send(
        &app.router,
        post("/api/subscriptions", json!({ "subscriber_id": "9", "ticker": "AAPL" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not registered"));

    register_and_subscribe(&app, "9", "AAPL").await;

    let (status, _) = send(
        &app.router,
        post("/api/subscriptions", json!({ "subscriber_id": "9", "ticker": "AAPL" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app.router,
        post(
            "/api/subscriptions/unsubscribe",
            json!({ "subscriber_id": "9", "ticker": "MSFT" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_trigger_changes_state_and_notifies() {
    let app = test_app(&[]);
    register_and_subscribe(&app, "1", "AAPL").await;
    register_and_subscribe(&app, "2", "AAPL").await;

    let (status, body) = send(&app.router, get("/api/analysis")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "success");
    assert_eq!(body["changed"], 1);
    assert_eq!(body["notified"], 2);

    let mut recipients = app.sink.recipients.lock().unwrap().clone();
    recipients.sort();
    assert_eq!(recipients, vec!["1", "2"]);

    let subs = app
        .store
        .list_subscriptions(&subscription_store::SubscriptionFilter::all())
        .await
        .unwrap();
    assert_eq!(subs[0].state.name, "Strong Buy");

    // Unchanged data: no further notifications.
    let (_, body) = send(&app.router, get("/api/analysis")).await;
    assert_eq!(body["changed"], 0);
    assert_eq!(app.sink.recipients.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_on_demand_trigger_only_messages_requester() {
    let app = test_app(&[]);
    register_and_subscribe(&app, "1", "AAPL").await;
    register_and_subscribe(&app, "2", "AAPL").await;

    let (status, body) = send(&app.router, get("/api/analysis?subscriber_id=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "on_demand");
    assert_eq!(body["notified"], 1);
    assert_eq!(*app.sink.recipients.lock().unwrap(), vec!["2".to_string()]);

    // Nothing persisted.
    let subs = app
        .store
        .list_subscriptions(&subscription_store::SubscriptionFilter::all())
        .await
        .unwrap();
    assert_eq!(subs[0].state.name, "Hold");
}

#[tokio::test]
async fn test_empty_subscriber_id_runs_batch() {
    let app = test_app(&[]);
    let (_, body) = send(&app.router, get("/api/analysis?subscriber_id=")).await;
    assert_eq!(body["mode"], "batch");
}

#[tokio::test]
async fn test_pause_notifications() {
    let app = test_app(&[]);
    let created = register_and_subscribe(&app, "1", "AAPL").await;

    let (status, body) = send(
        &app.router,
        post(
            "/api/subscriptions/notifications",
            json!({ "subscriber_id": "1", "subscription_id": created["id"], "active": false }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notifications_active"], false);

    let (_, body) = send(&app.router, get("/api/analysis")).await;
    assert_eq!(body["changed"], 1);
    assert_eq!(body["notified"], 0);
    assert!(app.sink.recipients.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let app = test_app(&["secret-key-123"]);

    let (status, _) = send(&app.router, get("/api/analysis")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/analysis")
        .header("Authorization", "Api-Key wrong-key-456")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .uri("/api/analysis")
        .header("Authorization", "Api-Key secret-key-123")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "No active subscriptions");
}
