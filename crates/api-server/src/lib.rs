pub mod analysis_routes;
pub mod auth;
pub mod subscription_routes;

#[cfg(test)]
mod api_tests;

use std::sync::Arc;

use advisory_core::AdvisoryError;
use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use notification_service::{NotificationConfig, NotificationDispatcher};
use polygon_client::{PolygonClient, PolygonConfig};
use serde_json::json;
use state_classifier::RuleSetDefinition;
use subscription_store::{SqliteStore, StoreConfig, SubscriptionError, SubscriptionStore};
use technical_analysis::{IndicatorConfig, IndicatorEngine};
use tokio::signal::unix::SignalKind;
use tower_http::trace::TraceLayer;
use trigger_controller::{TriggerConfig, TriggerController};

use auth::ApiKeys;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// JSON rule set used to seed an empty database.
    pub rules_path: Option<String>,
}

impl ApiConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("API_BIND_ADDR")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            rules_path: std::env::var("RULES_PATH").ok().filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubscriptionStore>,
    pub controller: Arc<TriggerController>,
    pub api_keys: Arc<ApiKeys>,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<AdvisoryError> for AppError {
    fn from(err: AdvisoryError) -> Self {
        match err {
            AdvisoryError::InvalidInput(_) => AppError::BadRequest(err.to_string()),
            AdvisoryError::NotFound(_) => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<SubscriptionError> for AppError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Internal(inner) => inner.into(),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

/// The full router, authentication included.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(analysis_routes::analysis_routes())
        .merge(subscription_routes::subscription_routes())
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ApiConfig::from_env();
    let rules = match &config.rules_path {
        Some(path) => {
            tracing::info!("Loading state rules from {}", path);
            RuleSetDefinition::from_file(path)?
        }
        None => RuleSetDefinition::standard(),
    };

    let store_config = StoreConfig::from_env();
    let store = SqliteStore::connect(&store_config, &rules).await?;
    tracing::info!("Subscription store ready ({})", store_config.database_url);

    let polygon_config = PolygonConfig::from_env();
    if polygon_config.api_key.is_empty() {
        tracing::warn!("POLYGON_API_KEY is not set, price history requests will fail");
    }
    let source = Arc::new(PolygonClient::new(polygon_config));
    let dispatcher = Arc::new(NotificationDispatcher::from_config(&NotificationConfig::from_env()));
    let engine = IndicatorEngine::new(IndicatorConfig::from_env());

    let store: Arc<dyn SubscriptionStore> = Arc::new(store);
    let controller = TriggerController::new(
        Arc::clone(&store),
        source,
        dispatcher,
        engine,
        TriggerConfig::from_env(),
    );

    let api_keys = ApiKeys::from_env();
    if !api_keys.is_enabled() {
        tracing::warn!("API_KEYS is not set, authentication is disabled");
    }

    let state = AppState {
        store,
        controller: Arc::new(controller),
        api_keys: Arc::new(api_keys),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Advisory API listening on {}", config.bind_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }
}
