use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{Event, Notifier};
use crate::error::Error;
use crate::Result;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram delivery for trading events.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`. Returns
    /// `None` when neither is set so callers can fall back to logging.
    pub fn from_env() -> Result<Option<Self>> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();

        match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Ok(Some(Self::new(token, chat_id)))
            }
            (None, None) => Ok(None),
            _ => Err(Error::config(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must both be set",
            )),
        }
    }

    /// Override the API host (tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn format_message(event: &Event) -> String {
        let mut lines = vec![format!("*{}*", event.kind.title())];
        for (key, value) in &event.payload {
            lines.push(format!("{key}: {value}"));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &Event) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": Self::format_message(event),
            "parse_mode": "Markdown",
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Notify(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Notify(format!(
                "telegram returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
