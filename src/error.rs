//! Crate-wide error taxonomy.
//!
//! Mirrors the wire-facing error shape every caller of the gateway core
//! needs: a `kind` plus enough routing context (`routing_id`, `pool_id`,
//! `provider_id`, `attempt`) to decide whether to retry, fall back, or
//! surface the failure to the end user.

use thiserror::Error;

/// Whether a provider-side failure should trigger a retry on the next
/// target, or propagate immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no pool registered for routing class '{routing_id}'")]
    RoutingNotFound { routing_id: String },

    #[error("pool '{pool_id}' has no active pipeline")]
    NoActivePipeline { pool_id: String },

    #[error("no pool met the routing strategy's minimum match threshold")]
    NoCandidates,

    #[error("provider '{provider_id}' error on attempt {attempt}: {cause}")]
    Provider {
        provider_id: String,
        attempt: u32,
        class: ErrorClass,
        cause: String,
    },

    #[error("request to provider '{provider_id}' timed out on attempt {attempt}")]
    Timeout { provider_id: String, attempt: u32 },

    #[error("request was cancelled")]
    Cancelled,

    #[error("assembly failed: {reason}")]
    AssemblyFailed { reason: String },

    #[error("no routing strategy available (none enabled or none default)")]
    NoStrategy,

    #[error("scheduler is not initialised")]
    Uninitialised,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Provider {
                class: ErrorClass::Retryable,
                ..
            } | GatewayError::Timeout { .. }
        )
    }

    /// Classify a raw provider failure into a `GatewayError`, defaulting to
    /// retryable when the cause is ambiguous.
    pub fn from_provider_failure(
        provider_id: impl Into<String>,
        attempt: u32,
        class: ErrorClass,
        cause: impl std::fmt::Display,
    ) -> Self {
        GatewayError::Provider {
            provider_id: provider_id.into(),
            attempt,
            class,
            cause: cause.to_string(),
        }
    }
}
