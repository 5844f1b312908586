//! Backend Descriptors and Adapter Trait
//!
//! The core never builds provider payloads. Each backend is reached through
//! a [`BackendAdapter`] that takes an opaque envelope and answers with
//! content, measured consumption, and a classification.
//!
//! # Classification
//!
//! - `Success`: content is usable (subject to the stage's output check)
//! - `Capacity`: backend is overloaded or over quota; escalate, do not penalize
//! - `Failure`: backend misbehaved; feeds the circuit breaker

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, StageKind};

/// Abstract cost model: consumed units times a unit price
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub unit_price: f64,
}

impl CostModel {
    #[must_use]
    pub fn new(unit_price: f64) -> Self {
        Self { unit_price }
    }

    #[must_use]
    pub fn cost_of(&self, consumed_units: u64) -> f64 {
        consumed_units as f64 * self.unit_price
    }
}

/// Static description of an inference backend
#[derive(Clone, Debug, PartialEq)]
pub struct Backend {
    pub id: String,
    pub provider: String,

    /// Capability tier; higher is more capable and more expensive
    pub tier: u32,

    pub cost: CostModel,

    /// Upper bound for a single adapter call
    pub call_timeout: Option<Duration>,
}

/// Response classification reported by an adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Success,
    Capacity,
    Failure,
}

/// Envelope sent to an adapter
#[derive(Clone, Debug, Serialize)]
pub struct AdapterRequest {
    pub job_id: JobId,
    pub backend_id: String,
    pub stage: StageKind,
    pub stage_index: usize,

    /// 1-based call count within the stage
    pub attempt: u32,

    /// Label of the leased execution context, if the stage holds one
    pub resource: Option<String>,

    pub payload: serde_json::Value,
}

/// Envelope returned by an adapter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    pub content: String,
    pub consumed_units: u64,
    pub classification: Classification,
}

impl AdapterResponse {
    pub fn success(content: impl Into<String>, consumed_units: u64) -> Self {
        Self {
            content: content.into(),
            consumed_units,
            classification: Classification::Success,
        }
    }

    #[must_use]
    pub fn capacity(consumed_units: u64) -> Self {
        Self {
            content: String::new(),
            consumed_units,
            classification: Classification::Capacity,
        }
    }

    #[must_use]
    pub fn failure(consumed_units: u64) -> Self {
        Self {
            content: String::new(),
            consumed_units,
            classification: Classification::Failure,
        }
    }
}

/// Transport-level adapter errors; always treated as `Failure`
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode backend response: {0}")]
    Decode(String),
}

/// Gateway to an external backend
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &str;

    /// Issue one call. `Err` means the call never produced a response.
    async fn invoke(&self, request: AdapterRequest) -> Result<AdapterResponse, AdapterError>;
}

/// Adapters keyed by backend id
pub type AdapterSet = HashMap<String, Arc<dyn BackendAdapter>>;
