mod chart;
mod dispatcher;
mod telegram;
mod templates;

pub use chart::{ChartError, ChartRenderer, PlottersChartRenderer};
pub use dispatcher::{DispatchOutcome, DispatchReport, NotificationDispatcher};
pub use telegram::TelegramSink;
pub use templates::AdvisoryMessage;

use std::sync::Arc;

use advisory_core::{DeliveryError, MessagingSink, SubscriberId};
use async_trait::async_trait;

/// Configuration for the notification service.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_api_url: String,
    pub charts_enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_api_url: "https://api.telegram.org".to_string(),
            charts_enabled: true,
        }
    }
}

impl NotificationConfig {
    /// Load from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.telegram_api_url),
            charts_enabled: std::env::var("NOTIFICATION_CHARTS")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(defaults.charts_enabled),
        }
    }
}

impl NotificationDispatcher {
    /// Dispatcher wired to Telegram when a bot token is configured, else to the log.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let sink: Arc<dyn MessagingSink> = match &config.telegram_bot_token {
            Some(token) => {
                tracing::info!("Telegram notifications enabled");
                Arc::new(TelegramSink::with_api_url(&config.telegram_api_url, token))
            }
            None => {
                tracing::info!("No messaging channel configured (set TELEGRAM_BOT_TOKEN), logging notifications");
                Arc::new(LogSink)
            }
        };

        let dispatcher = NotificationDispatcher::new(sink);
        if config.charts_enabled {
            dispatcher.with_renderer(Arc::new(PlottersChartRenderer::default()))
        } else {
            dispatcher
        }
    }
}

/// Sink that only writes notifications to the log.
pub struct LogSink;

#[async_trait]
impl MessagingSink for LogSink {
    async fn send(
        &self,
        recipient: &SubscriberId,
        text: &str,
        image: Option<&[u8]>,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            recipient = %recipient,
            image_bytes = image.map(|i| i.len()).unwrap_or(0),
            "{}",
            text
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
