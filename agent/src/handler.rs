//! Executes tunnelled requests against the local backend.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use burrow_protocol::message::{TunnelledRequest, TunnelledResponse};

/// Backend client timeout.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid method: {0}")]
    Method(String),
    #[error("executing backend request: {0}")]
    Http(#[from] reqwest::Error),
}

/// Turns tunnelled requests into real HTTP requests against the backend.
pub struct RequestHandler {
    target_url: String,
    client: Client,
}

impl RequestHandler {
    pub fn new(target_url: &str) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(BACKEND_TIMEOUT).build()?;
        Ok(Self {
            target_url: target_url.to_string(),
            client,
        })
    }

    /// Deserialise a tunnelled request, execute it against the backend, and
    /// return the serialised response.
    pub async fn handle(&self, data: &[u8]) -> Result<Vec<u8>, BackendError> {
        let request: TunnelledRequest = serde_json::from_slice(data)?;

        let backend_url = format!("{}{}", self.target_url, request.url);
        debug!(method = %request.method, url = %backend_url, "forwarding request to backend");

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| BackendError::Method(request.method.clone()))?;

        let mut builder = self.client.request(method, &backend_url);
        for (key, value) in &request.headers {
            // the backend sees its own host, not the relay's
            if key.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status_code = response.status().as_u16();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(key.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        let body = response.bytes().await?.to_vec();

        let tunnelled = TunnelledResponse {
            status_code,
            headers,
            body,
        };
        Ok(serde_json::to_vec(&tunnelled)?)
    }
}

/// Serialised error response for requests that never reached the backend.
pub fn error_response(status_code: u16, message: &str) -> Vec<u8> {
    serde_json::to_vec(&TunnelledResponse::error(status_code, message))
        .expect("error response serialises")
}
