use std::time::Duration;

use serde_json::json;
use tracing::{debug, error};
use url::Url;

use crate::secret::Secret;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Incoming-webhook chat client for the operator channel.
#[derive(Debug)]
pub struct Chat {
    client: reqwest::Client,
    webhook_url: Option<Secret<Url>>,
}

impl Chat {
    pub fn new(webhook_url: Secret<Url>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            webhook_url: Some(webhook_url),
        })
    }

    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: None,
        }
    }

    pub async fn send(&self, text: &str) {
        let Some(webhook_url) = &self.webhook_url else {
            debug!(text, "chat disabled, message not sent");
            return;
        };
        let result = self
            .client
            .post(webhook_url.url().clone())
            .json(&json!({ "text": text }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(text, status = %response.status(), "chat webhook rejected the message");
            }
            Err(send_error) => {
                error!(text, ?send_error, "could not reach the chat webhook");
            }
        }
    }
}
