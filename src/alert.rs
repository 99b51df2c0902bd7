//! Operator alerts.
//!
//! Alerts always go to the log. When a webhook is configured they are also
//! posted as `{"text": "<message>"}`, the payload Slack-style incoming webhooks accept.
//! Delivery failures are logged and otherwise ignored.

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    text: &'a str,
}

/// Sends operator alerts.
#[derive(Debug, Clone)]
pub struct Alerter {
    webhook_url: Option<String>,
    client: Client,
}

impl Alerter {
    /// Creates an alerter; `None` only logs.
    pub fn new(webhook_url: Option<&str>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            webhook_url: webhook_url.map(str::to_string),
            client,
        }
    }

    /// An alerter that only logs.
    pub fn log_only() -> Self {
        Self {
            webhook_url: None,
            client: Client::new(),
        }
    }

    /// Logs the alert and posts it to the webhook, if any.
    pub async fn alert(&self, message: &str) {
        error!("ALERT: {}", message);

        let Some(url) = self.webhook_url.as_deref() else {
            return;
        };
        match self
            .client
            .post(url)
            .json(&AlertPayload { text: message })
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                warn!("Alert webhook answered {}", response.status());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to deliver alert: {}", e),
        }
    }
}
