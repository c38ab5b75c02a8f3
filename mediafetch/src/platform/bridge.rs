//! HTTP bridge to out-of-process platform adapters.
//!
//! The adapter service owns platform credentials and API quirks. This side
//! speaks a small JSON protocol:
//!
//! - `GET  {base}/sources/{source}/items?after_position=..&after_id=..` returns
//!   a JSON array of [`ContentItem`]s, oldest first.
//! - `POST {base}/recipients/{recipient}/messages` takes a [`BridgeMessage`]
//!   and returns a [`DeliveryAck`].

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{
    DeliveryAck, DeliveryMetadata, DeliverySender, FetchError, Payload, SendError, SourceFetcher,
};
use super::http::install_rustls_provider;
use crate::domain::{ContentItem, Cursor, RecipientId, SourceId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            token: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Body of a send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub metadata: DeliveryMetadata,
    pub content_type: Option<String>,
    /// Base64 payload bytes; absent for text-only items.
    pub payload: Option<String>,
}

#[derive(Clone)]
struct BridgeClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl BridgeClient {
    fn new(config: &BridgeConfig) -> crate::Result<Self> {
        install_rustls_provider();
        let base = Url::parse(&config.base_url)
            .map_err(|e| crate::Error::config(format!("invalid bridge URL: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(crate::Error::config("bridge URL cannot be a base"));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build bridge client: {e}")))?;
        Ok(Self {
            client,
            base,
            token: config.token.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| "bridge URL cannot be a base".to_string())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Reads `Retry-After` in seconds.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_fetch_status(status: StatusCode, retry_after: Option<Duration>) -> Option<FetchError> {
    match status {
        s if s.is_success() => None,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Some(FetchError::AuthExpired(format!("HTTP {status}")))
        }
        StatusCode::TOO_MANY_REQUESTS => Some(FetchError::RateLimited { retry_after }),
        _ => Some(FetchError::Unreachable(format!("HTTP {status}"))),
    }
}

fn classify_send_status(status: StatusCode) -> Option<SendError> {
    match status {
        s if s.is_success() => None,
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
            Some(SendError::RecipientInvalid(format!("HTTP {status}")))
        }
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY => {
            Some(SendError::PayloadRejected(format!("HTTP {status}")))
        }
        _ => Some(SendError::Unreachable(format!("HTTP {status}"))),
    }
}

/// [`SourceFetcher`] backed by the bridge.
pub struct HttpSourceFetcher {
    inner: BridgeClient,
}

impl HttpSourceFetcher {
    pub fn new(config: &BridgeConfig) -> crate::Result<Self> {
        Ok(Self {
            inner: BridgeClient::new(config)?,
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch_new_items(
        &self,
        source: &SourceId,
        since: Option<&Cursor>,
    ) -> Result<Vec<ContentItem>, FetchError> {
        let url = self
            .inner
            .url(&["sources", source.as_str(), "items"])
            .map_err(FetchError::Unreachable)?;

        let mut request = self.inner.client.get(url);
        if let Some(cursor) = since {
            request = request.query(&[
                ("after_position", cursor.position.to_string()),
                ("after_id", cursor.item_id.clone()),
            ]);
        }

        let response = self
            .inner
            .authorize(request)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        if let Some(err) = classify_fetch_status(response.status(), retry_after(&response)) {
            return Err(err);
        }

        let items: Vec<ContentItem> = response
            .json()
            .await
            .map_err(|e| FetchError::Unreachable(format!("malformed item list: {e}")))?;
        debug!(source = %source, count = items.len(), "Fetched items from bridge");
        Ok(items)
    }
}

/// [`DeliverySender`] backed by the bridge.
pub struct HttpDeliverySender {
    inner: BridgeClient,
}

impl HttpDeliverySender {
    pub fn new(config: &BridgeConfig) -> crate::Result<Self> {
        Ok(Self {
            inner: BridgeClient::new(config)?,
        })
    }
}

#[async_trait]
impl DeliverySender for HttpDeliverySender {
    async fn send(
        &self,
        recipient: &RecipientId,
        payload: &Payload,
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, SendError> {
        let url = self
            .inner
            .url(&["recipients", recipient.as_str(), "messages"])
            .map_err(SendError::Unreachable)?;

        let body = BridgeMessage {
            metadata: metadata.clone(),
            content_type: payload.content_type.clone(),
            payload: (!payload.bytes.is_empty()).then(|| STANDARD.encode(&payload.bytes)),
        };

        let response = self
            .inner
            .authorize(self.inner.client.post(url).json(&body))
            .send()
            .await
            .map_err(|e| SendError::Unreachable(e.to_string()))?;

        if let Some(err) = classify_send_status(response.status()) {
            return Err(err);
        }

        // A 2xx means the message went out; retrying on a bad body would
        // deliver it twice.
        match response.json::<DeliveryAck>().await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                warn!(task_id = %metadata.task_id, error = %e, "Bridge returned an unreadable acknowledgment");
                Ok(DeliveryAck {
                    message_id: String::new(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_fetch_status_classification() {
        assert!(classify_fetch_status(StatusCode::OK, None).is_none());
        assert!(matches!(
            classify_fetch_status(StatusCode::UNAUTHORIZED, None),
            Some(FetchError::AuthExpired(_))
        ));
        assert!(matches!(
            classify_fetch_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(9))),
            Some(FetchError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(9)
        ));
        assert!(matches!(
            classify_fetch_status(StatusCode::SERVICE_UNAVAILABLE, None),
            Some(FetchError::Unreachable(_))
        ));
    }

    #[rstest]
    #[case(StatusCode::FORBIDDEN, "recipient")]
    #[case(StatusCode::NOT_FOUND, "recipient")]
    #[case(StatusCode::GONE, "recipient")]
    #[case(StatusCode::BAD_REQUEST, "payload")]
    #[case(StatusCode::PAYLOAD_TOO_LARGE, "payload")]
    #[case(StatusCode::UNSUPPORTED_MEDIA_TYPE, "payload")]
    #[case(StatusCode::BAD_GATEWAY, "unreachable")]
    #[case(StatusCode::TOO_MANY_REQUESTS, "unreachable")]
    fn test_send_status_classification(#[case] status: StatusCode, #[case] expected: &str) {
        let kind = match classify_send_status(status) {
            Some(SendError::RecipientInvalid(_)) => "recipient",
            Some(SendError::PayloadRejected(_)) => "payload",
            Some(SendError::Unreachable(_)) => "unreachable",
            None => "ok",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_send_success_is_not_classified() {
        assert!(classify_send_status(StatusCode::OK).is_none());
        assert!(classify_send_status(StatusCode::ACCEPTED).is_none());
    }

    #[test]
    fn test_urls_escape_identities() {
        let client = BridgeClient::new(&BridgeConfig {
            base_url: "http://bridge.local/api".to_string(),
            ..Default::default()
        })
        .unwrap();
        let url = client.url(&["sources", "a/b c", "items"]).unwrap();
        assert_eq!(url.as_str(), "http://bridge.local/api/sources/a%2Fb%20c/items");
    }

    #[test]
    fn test_invalid_base_url_is_configuration_error() {
        let err = HttpSourceFetcher::new(&BridgeConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, crate::Error::Configuration(_)));
    }
}
