//! Periodic batch trigger for the advisory API.

mod config;

use anyhow::Result;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::time;

use config::SchedulerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

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

    let config = SchedulerConfig::from_env()?;
    tracing::info!(
        "Triggering {} every {}s",
        config.analysis_url(),
        config.interval_seconds
    );

    // Batch runs can take a while with many subscriptions.
    let client = Client::builder()
        .timeout(Duration::from_secs(config.interval_seconds.max(60)))
        .build()?;

    let mut interval = time::interval(Duration::from_secs(config.interval_seconds));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match trigger(&client, &config).await {
                    Ok(StatusCode::OK) => tracing::info!("Batch trigger completed"),
                    Ok(status) => tracing::warn!("Batch trigger returned HTTP {}", status),
                    Err(e) => tracing::error!("Batch trigger failed: {}", e),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Scheduler shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn trigger(client: &Client, config: &SchedulerConfig) -> Result<StatusCode> {
    let mut request = client.get(config.analysis_url());
    if let Some(key) = &config.api_key {
        request = request.header("Authorization", format!("Api-Key {}", key));
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::debug!("Trigger response: {}", body);
    Ok(status)
}
