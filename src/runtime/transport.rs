//! HTTP transport seam
//!
//! Sites never talk to the network directly. Every fetch step goes through an
//! injected [`Transport`], so tests can script responses and the host can
//! share one connection pool across sites.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::error::{StepError, StepResult, TransportError, TransportResult};
use crate::interpreter::{FetchMethod, FetchRequest, RequestBody, ResponseShape};
use crate::util::json::decode_json;

/// Asynchronous HTTP client used by sites
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url`, returning the body.
    async fn get(&self, url: &Url, headers: &[(String, String)]) -> TransportResult<Vec<u8>>;

    /// POST `body` to `url`, returning the response body.
    async fn post(
        &self,
        url: &Url,
        headers: &[(String, String)],
        body: &RequestBody,
    ) -> TransportResult<Vec<u8>>;

    /// HEAD `url`; success means the resource exists.
    async fn head(&self, url: &Url) -> TransportResult<()>;

    /// Separate short-lived instance for wait-mode calls.
    ///
    /// `None` means wait-mode calls reuse this instance.
    fn isolated(&self) -> Option<Arc<dyn Transport>> {
        None
    }
}

/// reqwest-backed transport with a per-request timeout
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, timeout }
    }

    /// Configured per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> TransportResult<Vec<u8>> {
        let response = request
            .send()
            .await
            .map_err(|err| classify(err, url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|err| classify(err, url))?;
        Ok(bytes.to_vec())
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url, headers: &[(String, String)]) -> TransportResult<Vec<u8>> {
        debug!(%url, "GET");
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, url).await
    }

    async fn post(
        &self,
        url: &Url,
        headers: &[(String, String)],
        body: &RequestBody,
    ) -> TransportResult<Vec<u8>> {
        debug!(%url, bytes = body.bytes.len(), "POST");
        let mut request = self
            .client
            .post(url.clone())
            .header("Content-Type", body.content_type)
            .body(body.bytes.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, url).await
    }

    async fn head(&self, url: &Url) -> TransportResult<()> {
        debug!(%url, "HEAD");
        self.send(self.client.head(url.clone()), url).await.map(|_| ())
    }

    fn isolated(&self) -> Option<Arc<dyn Transport>> {
        Some(Arc::new(HttpTransport::new(self.timeout)))
    }
}

fn classify(err: reqwest::Error, url: &Url) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(url.to_string())
    } else if err.is_builder() {
        TransportError::InvalidUrl(url.to_string())
    } else if let Some(status) = err.status() {
        TransportError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        TransportError::Network(err.to_string())
    }
}

/// Execute a prepared request and decode the reply by its declared shape.
pub async fn fetch(transport: &dyn Transport, request: &FetchRequest) -> StepResult<Value> {
    let bytes = match request.method {
        FetchMethod::Head => {
            return Ok(Value::Bool(transport.head(&request.url).await.is_ok()));
        }
        FetchMethod::Get => transport.get(&request.url, &request.headers).await?,
        FetchMethod::Post => {
            let body = request.body.clone().unwrap_or_else(|| RequestBody::json(Vec::new()));
            transport.post(&request.url, &request.headers, &body).await?
        }
    };
    decode(request.shape, &bytes)
}

/// Decode a response body.
pub fn decode(shape: ResponseShape, bytes: &[u8]) -> StepResult<Value> {
    match shape {
        ResponseShape::Json => decode_json(bytes).map_err(|err| StepError::Decode(err.to_string())),
        ResponseShape::Text => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        ResponseShape::Exists => Ok(Value::Bool(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_by_shape() {
        assert_eq!(
            decode(ResponseShape::Json, br#"{"a": 1}"#).unwrap(),
            json!({"a": 1})
        );
        assert!(matches!(
            decode(ResponseShape::Json, b"<html>"),
            Err(StepError::Decode(_))
        ));
        assert_eq!(
            decode(ResponseShape::Text, b"caf\xc3\xa9 \xff").unwrap(),
            json!("café \u{fffd}")
        );
    }

    #[test]
    fn http_transport_isolates_wait_calls() {
        let transport = HttpTransport::new(Duration::from_secs(3));
        assert_eq!(transport.timeout(), Duration::from_secs(3));
        assert!(transport.isolated().is_some());
    }
}
