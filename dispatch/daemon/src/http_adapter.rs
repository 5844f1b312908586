//! HTTP Envelope Adapter
//!
//! Posts the adapter request envelope as JSON to a backend's configured
//! endpoint and maps the HTTP answer back to a classified response.
//!
//! | HTTP status        | Classification |
//! |--------------------|----------------|
//! | 2xx                | body decides (default `success`) |
//! | 429, 503           | `capacity`     |
//! | anything else      | `failure`      |
//!
//! The provider payload inside the envelope is opaque to this adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use dispatch_core::{
    AdapterError, AdapterRequest, AdapterResponse, AdapterSet, BackendAdapter, Classification,
    DispatchConfig,
};

/// Connect timeout; per-call budgets are enforced by the router
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum HttpAdapterError {
    #[error("backend {0} has no endpoint configured")]
    MissingEndpoint(String),

    #[error("failed to build HTTP client for backend {backend}: {source}")]
    Client {
        backend: String,
        source: reqwest::Error,
    },
}

/// Body a backend answers with on 2xx
#[derive(Debug, Deserialize)]
struct EnvelopeReply {
    content: String,
    #[serde(default)]
    consumed_units: u64,
    #[serde(default)]
    classification: Option<Classification>,
}

/// Classification implied by a non-success status
fn classify_status(status: StatusCode) -> Option<Classification> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        Some(Classification::Capacity)
    } else {
        Some(Classification::Failure)
    }
}

pub struct HttpEnvelopeAdapter {
    backend_id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEnvelopeAdapter {
    pub fn new(backend_id: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, HttpAdapterError> {
        let backend_id = backend_id.into();
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|source| HttpAdapterError::Client {
                backend: backend_id.clone(),
                source,
            })?;

        Ok(Self {
            backend_id,
            endpoint: endpoint.into(),
            client,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BackendAdapter for HttpEnvelopeAdapter {
    fn name(&self) -> &str {
        &self.backend_id
    }

    async fn invoke(&self, request: AdapterRequest) -> Result<AdapterResponse, AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let status = response.status();
        if let Some(classification) = classify_status(status) {
            tracing::debug!(
                backend = %self.backend_id,
                status = status.as_u16(),
                classification = ?classification,
                "Backend answered with non-success status"
            );
            return Ok(AdapterResponse {
                content: String::new(),
                consumed_units: 0,
                classification,
            });
        }

        let reply: EnvelopeReply = response
            .json()
            .await
            .map_err(|e| AdapterError::Decode(e.to_string()))?;

        Ok(AdapterResponse {
            content: reply.content,
            consumed_units: reply.consumed_units,
            classification: reply.classification.unwrap_or(Classification::Success),
        })
    }
}

/// One HTTP adapter per configured backend
pub fn adapters_for(config: &DispatchConfig) -> Result<AdapterSet, HttpAdapterError> {
    let mut adapters = AdapterSet::new();
    for backend in &config.backends {
        let endpoint = backend
            .endpoint
            .as_deref()
            .ok_or_else(|| HttpAdapterError::MissingEndpoint(backend.id.clone()))?;
        let adapter = HttpEnvelopeAdapter::new(backend.id.clone(), endpoint)?;
        adapters.insert(backend.id.clone(), Arc::new(adapter) as Arc<dyn BackendAdapter>);
    }
    Ok(adapters)
}
