use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{Event, ImageRef, Notifier, NotifyConfig};
use crate::error::{BotError, Result};
use crate::models::UserId;

type TelegramRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Envelope returned by every Bot API method
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

/// Telegram Bot API notifier
///
/// Cloneable; all clones share the HTTP client and rate limiter.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    token: String,
    rate_limiter: Arc<TelegramRateLimiter>,
}

impl TelegramNotifier {
    pub fn new(token: String, config: &NotifyConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let per_second = NonZeroU32::new(config.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token,
            rate_limiter,
        })
    }

    pub async fn send_message(&self, chat_id: UserId, text: &str) -> Result<()> {
        self.call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await
    }

    pub async fn send_photo(&self, chat_id: UserId, photo: &ImageRef, caption: &str) -> Result<()> {
        self.call(
            "sendPhoto",
            json!({ "chat_id": chat_id, "photo": photo.0, "caption": caption }),
        )
        .await
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<()> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let api: ApiResponse = response.json().await?;

        if !status.is_success() || !api.ok {
            return Err(BotError::Notify(format!(
                "{} failed ({}): {}",
                method,
                status,
                api.description.unwrap_or_else(|| "no description".to_string())
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: UserId, event: &Event, image: Option<&ImageRef>) -> Result<()> {
        let text = event.render();
        match image {
            Some(image) => self.send_photo(recipient, image, &text).await,
            None => self.send_message(recipient, &text).await,
        }
    }
}
