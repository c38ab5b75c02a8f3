//! Webhook alert sink (HTTP POST of a JSON envelope).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Alert, AlertEnvelope, AlertSeverity, AlertSink};
use crate::platform::http::install_rustls_provider;

/// Webhook sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAlertConfig {
    pub url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Alerts below this severity are dropped.
    #[serde(default = "default_min_severity")]
    pub min_severity: AlertSeverity,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_min_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

fn default_timeout() -> u64 {
    10
}

pub struct WebhookAlertSink {
    config: WebhookAlertConfig,
    client: Client,
}

impl WebhookAlertSink {
    pub fn new(config: WebhookAlertConfig) -> crate::Result<Self> {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build webhook client: {e}")))?;
        Ok(Self { config, client })
    }

    fn accepts(&self, alert: &Alert) -> bool {
        alert.severity() >= self.config.min_severity
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn alert(&self, alert: Alert) {
        if !self.accepts(&alert) {
            debug!(kind = alert.kind(), "Alert below webhook threshold");
            return;
        }

        let mut request = self
            .client
            .post(&self.config.url)
            .json(&AlertEnvelope::new(&alert));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        // Detached so a slow endpoint never holds up the caller.
        let kind = alert.kind();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(kind, "Alert webhook delivered");
                }
                Ok(response) => {
                    warn!(kind, status = %response.status(), "Alert webhook rejected");
                }
                Err(e) => {
                    warn!(kind, error = %e, "Alert webhook request failed");
                }
            }
        });
    }
}
