use anyhow::{Context, Result};
use reqwest::Client;

use super::{BreakerAlert, Notifier};

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
}

impl SlackNotifier {
    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &BreakerAlert) -> Result<()> {
        let text = format!(
            "*{}*\nReason: {}\n@ {}",
            alert.title(),
            alert.reason_str(),
            alert.at.to_rfc3339()
        );
        let body = serde_json::json!({ "text": text });

        self.client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }
}
