//! The `Provider` capability — the opaque handle the Pipeline dispatches to.
//!
//! Concrete HTTP transports are explicitly out of scope (§1); what's
//! specified here is the *contract* (§6) and a closed registration model in
//! place of string-keyed dynamic provider loading.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorClass, GatewayError};
use crate::request::Request;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: Value,
    pub finish_reason: Option<String>,
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: Value,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthState,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub provider_type: String,
    pub supported_models: Vec<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConstructorOpts {
    pub name: String,
    pub endpoint: String,
    pub supported_models: Vec<String>,
    pub default_model: Option<String>,
    pub max_tokens: Option<u64>,
    pub metadata: HashMap<String, Value>,
}

pub struct ExecuteOpts {
    pub timeout: std::time::Duration,
    pub metadata: HashMap<String, Value>,
}

/// A connection-established chunk sequence. Each item is a chunk the
/// provider has already produced; an `Err` item signals the stream died
/// mid-response, distinct from the outer `Result` on `execute_streaming`
/// itself failing before any connection was made.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

/// The external collaborator contract (§6). Concrete transports
/// (OpenAI/Qwen/iFlow HTTP clients) live outside this crate; tests exercise
/// the seam with an in-memory fake.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn execute(
        &self,
        request: &Request,
        opts: &ExecuteOpts,
    ) -> Result<ProviderResponse, GatewayError>;

    /// Establishes a lazily-produced chunk sequence. The outer `Result`
    /// only covers connection setup; once it resolves to `Ok`, failures are
    /// reported as `Err` items on the returned stream itself (§4.2).
    async fn execute_streaming(
        &self,
        request: &Request,
        opts: &ExecuteOpts,
    ) -> Result<ProviderStream, GatewayError>;

    async fn health_check(&self) -> HealthCheckResult;

    fn info(&self) -> ProviderInfo;

    /// Clone this provider, narrowed to a single (model, key) permutation —
    /// the Assembler's §4.4 step 2 "configured provider" operation.
    fn configured_for(&self, model_id: &str, key_index: usize, routing_id: &str) -> Arc<dyn Provider>;
}

/// Closed tagged variant for built-in transports plus an open leaf for
/// externally supplied providers (§9's re-architecture of dynamic class
/// loading into an explicit factory table).
#[derive(Clone)]
pub enum ProviderKind {
    OpenAICompat(Arc<dyn Provider>),
    Qwen(Arc<dyn Provider>),
    IFlow(Arc<dyn Provider>),
    Custom(Arc<dyn Provider>),
}

impl ProviderKind {
    pub fn handle(&self) -> Arc<dyn Provider> {
        match self {
            ProviderKind::OpenAICompat(p)
            | ProviderKind::Qwen(p)
            | ProviderKind::IFlow(p)
            | ProviderKind::Custom(p) => Arc::clone(p),
        }
    }
}

/// Classifies a provider failure's message into retryable vs. fatal via a
/// fatal-marker word list, generalized away from provider-specific error
/// bodies. Ambiguous errors default to retryable per §7's error policy.
pub fn classify_provider_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let fatal_markers = [
        "invalid_request",
        "invalid request",
        "unauthorized",
        "authentication",
        "forbidden",
        "unsupported model",
        "model_not_found",
        "content_filter",
    ];
    if fatal_markers.iter().any(|m| lower.contains(m)) {
        ErrorClass::Fatal
    } else {
        ErrorClass::Retryable
    }
}
