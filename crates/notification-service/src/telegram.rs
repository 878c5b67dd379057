use advisory_core::{DeliveryError, MessagingSink, SubscriberId};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;

/// Telegram Bot API sink. The subscriber id is the chat id.
pub struct TelegramSink {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramSink {
    pub fn new(bot_token: &str) -> Self {
        Self::with_api_url("https://api.telegram.org", bot_token)
    }

    pub fn with_api_url(api_url: &str, bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }
}

/// Map a failed Bot API response onto the delivery taxonomy.
fn classify_status(status: StatusCode, body: &str) -> DeliveryError {
    let detail = format!("{}: {}", status, body);
    match status {
        // Unknown chat, blocked bot or malformed chat id
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => DeliveryError::RecipientInvalid(detail),
        _ => DeliveryError::Transient(detail),
    }
}

#[async_trait]
impl MessagingSink for TelegramSink {
    async fn send(
        &self,
        recipient: &SubscriberId,
        text: &str,
        image: Option<&[u8]>,
    ) -> Result<(), DeliveryError> {
        let request = match image {
            Some(png) => {
                let part = Part::bytes(png.to_vec())
                    .file_name("chart.png")
                    .mime_str("image/png")
                    .map_err(|e| DeliveryError::Transient(e.to_string()))?;
                let form = Form::new()
                    .text("chat_id", recipient.to_string())
                    .text("caption", text.to_string())
                    .part("photo", part);
                self.client.post(self.api_url("sendPhoto")).multipart(form)
            }
            None => self.client.post(self.api_url("sendMessage")).json(&serde_json::json!({
                "chat_id": recipient.as_str(),
                "text": text,
            })),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("Telegram message sent to {}", recipient);
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    fn name(&self) -> &str {
        "telegram"
    }
}
