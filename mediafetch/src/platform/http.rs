//! Plain HTTP(S) payload downloads.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use super::{ItemRef, Payload, PayloadError, PayloadFetcher};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Clone)]
pub struct HttpPayloadFetcherConfig {
    pub request_timeout: Duration,
    /// Larger payloads are refused.
    pub max_payload_bytes: u64,
    pub user_agent: String,
}

impl Default for HttpPayloadFetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_payload_bytes: 50 * 1024 * 1024,
            user_agent: concat!("mediafetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Fetches `payload_ref` URLs with a streaming size cap.
pub struct HttpPayloadFetcher {
    client: Client,
    config: HttpPayloadFetcherConfig,
}

impl HttpPayloadFetcher {
    pub fn new(config: HttpPayloadFetcherConfig) -> crate::Result<Self> {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

/// Map a response status to a payload error, `None` for success.
fn classify_status(status: StatusCode) -> Option<PayloadError> {
    if status.is_success() {
        None
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        Some(PayloadError::NotFound)
    } else {
        Some(PayloadError::Unreachable(format!("HTTP {status}")))
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch_payload(&self, item: &ItemRef) -> Result<Payload, PayloadError> {
        let url = Url::parse(&item.payload_ref)
            .map_err(|_| PayloadError::NotFound)?;
        let limit = self.config.max_payload_bytes;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PayloadError::Unreachable(e.to_string()))?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(PayloadError::TooLarge { limit });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PayloadError::Unreachable(e.to_string()))?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(PayloadError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(item_id = %item.item_id, bytes = body.len(), "Payload downloaded");

        Ok(Payload {
            bytes: body.freeze(),
            kind: item.kind,
            content_type,
        })
    }
}
