//! Pipeline: an ordered chain of targets with a load balancer and per-target
//! retries.
//!
//! Grounded on priority-tiered weighted selection with a per-target health
//! state machine, plus exponential backoff with jitter, generalized from
//! upstream-URL targets to `(provider, model, key-index)` triples.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorClass, GatewayError};
use crate::provider::{classify_provider_error, ExecuteOpts, HealthState, Provider, StreamChunk};
use crate::request::Request;

const CONSECUTIVE_FAILURES_TO_DEMOTE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    RoundRobin,
    Weighted,
    Random,
    LeastConnections,
}

/// A `(provider, model, key-index)` triple backed by a cloned provider
/// handle. `errorCount`/`requestCount`/`inFlight`/`healthStatus` are atomics
/// per the concurrency model (§5).
pub struct Target {
    pub id: String,
    pub provider: Arc<dyn Provider>,
    pub provider_id: String,
    pub model_id: String,
    pub key_index: usize,
    pub weight: f64,
    enabled: AtomicBool,
    healthy: AtomicBool,
    consecutive_errors: AtomicU32,
    request_count: AtomicU64,
    error_count: AtomicU64,
    in_flight: AtomicU64,
}

impl Target {
    pub fn new(
        id: impl Into<String>,
        provider: Arc<dyn Provider>,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        key_index: usize,
        weight: f64,
        enabled: bool,
    ) -> Self {
        Target {
            id: id.into(),
            provider,
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            key_index,
            weight,
            enabled: AtomicBool::new(enabled),
            healthy: AtomicBool::new(true),
            consecutive_errors: AtomicU32::new(0),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn is_selectable(&self) -> bool {
        self.is_enabled() && self.is_healthy()
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        if !self.healthy.swap(true, Ordering::Relaxed) {
            debug!(target = %self.id, "target restored to healthy after successful call");
        }
    }

    fn record_failure(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= CONSECUTIVE_FAILURES_TO_DEMOTE && self.healthy.swap(false, Ordering::Relaxed) {
            warn!(target = %self.id, consecutive, "target demoted to unhealthy");
        }
    }

    /// Active health-check result: one success restores health immediately,
    /// independent of the consecutive-error counter (§4.2 state machine).
    pub fn apply_health_check(&self, result: HealthState) {
        match result {
            HealthState::Healthy => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                self.healthy.store(true, Ordering::Relaxed);
            }
            HealthState::Unhealthy => {
                let consecutive = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if consecutive >= CONSECUTIVE_FAILURES_TO_DEMOTE {
                    self.healthy.store(false, Ordering::Relaxed);
                }
            }
        }
    }
}

pub struct Pipeline {
    pub id: String,
    pub targets: Vec<Arc<Target>>,
    pub load_balancing: LoadBalancingAlgorithm,
    pub health_check_interval: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
    round_robin_counter: AtomicU64,
}

pub struct ExecuteRequestOpts {
    pub timeout: Duration,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

impl Pipeline {
    pub fn new(
        id: impl Into<String>,
        targets: Vec<Arc<Target>>,
        load_balancing: LoadBalancingAlgorithm,
        health_check_interval: Duration,
        max_retries: u32,
        timeout: Duration,
    ) -> Self {
        Pipeline {
            id: id.into(),
            targets,
            load_balancing,
            health_check_interval,
            max_retries,
            timeout,
            metadata: Default::default(),
            round_robin_counter: AtomicU64::new(0),
        }
    }

    fn selectable_targets(&self) -> Vec<&Arc<Target>> {
        self.targets.iter().filter(|t| t.is_selectable()).collect()
    }

    /// Target selection, tie-broken by lexical target id for determinism
    /// (§4.2).
    fn select_target(&self) -> Option<Arc<Target>> {
        let mut candidates = self.selectable_targets();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = match self.load_balancing {
            LoadBalancingAlgorithm::RoundRobin => {
                let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as usize
                    % candidates.len();
                candidates[idx]
            }
            LoadBalancingAlgorithm::Weighted => {
                let total: f64 = candidates.iter().map(|t| t.weight.max(0.0)).sum();
                if total <= 0.0 {
                    candidates[0]
                } else {
                    let mut draw = rand::thread_rng().gen_range(0.0..total);
                    let mut selected = candidates[0];
                    for t in &candidates {
                        if draw < t.weight.max(0.0) {
                            selected = t;
                            break;
                        }
                        draw -= t.weight.max(0.0);
                    }
                    selected
                }
            }
            LoadBalancingAlgorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates[idx]
            }
            LoadBalancingAlgorithm::LeastConnections => *candidates
                .iter()
                .min_by_key(|t| t.in_flight())
                .expect("candidates is non-empty"),
        };
        Some(Arc::clone(chosen))
    }

    /// `execute(request, operation, opts) -> response`. Retries on the next
    /// target up to `max_retries` for retryable failures and timeouts;
    /// fatal errors propagate immediately (§4.2).
    pub async fn execute(
        &self,
        request: &Request,
        opts: &ExecuteRequestOpts,
    ) -> Result<crate::provider::ProviderResponse, GatewayError> {
        let mut attempt = 0u32;
        let mut last_err = None;

        loop {
            attempt += 1;
            let Some(target) = self.select_target() else {
                return Err(last_err.unwrap_or(GatewayError::NoActivePipeline {
                    pool_id: self.id.clone(),
                }));
            };

            target.in_flight.fetch_add(1, Ordering::Relaxed);
            let provider_opts = ExecuteOpts {
                timeout: opts.timeout,
                metadata: opts.metadata.clone(),
            };
            let result = tokio::time::timeout(opts.timeout, target.provider.execute(request, &provider_opts)).await;
            target.in_flight.fetch_sub(1, Ordering::Relaxed);

            match result {
                Ok(Ok(response)) => {
                    target.record_success();
                    return Ok(response);
                }
                Ok(Err(err)) => {
                    target.record_failure();
                    let class = classify_of(&err);
                    if class == ErrorClass::Fatal || attempt >= self.max_retries {
                        return Err(err);
                    }
                    debug!(target = %target.id, attempt, "retryable provider error, trying next target");
                    last_err = Some(err);
                }
                Err(_elapsed) => {
                    target.record_failure();
                    let timeout_err = GatewayError::Timeout {
                        provider_id: target.provider_id.clone(),
                        attempt,
                    };
                    if attempt >= self.max_retries {
                        return Err(timeout_err);
                    }
                    last_err = Some(timeout_err);
                }
            }

            jittered_backoff(attempt).await;
        }
    }

    /// Lazy chunk sequence. Target selection/retry applies only until the
    /// first chunk has been yielded to the caller; once that's happened, a
    /// failure on the underlying stream propagates without failover (§4.2).
    pub fn execute_streaming<'a>(
        &'a self,
        request: &'a Request,
        opts: &'a ExecuteRequestOpts,
    ) -> impl Stream<Item = Result<StreamChunk, GatewayError>> + 'a {
        stream! {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let Some(target) = self.select_target() else {
                    yield Err(GatewayError::NoActivePipeline {
                        pool_id: self.id.clone(),
                    });
                    return;
                };

                target.in_flight.fetch_add(1, Ordering::Relaxed);
                let provider_opts = ExecuteOpts {
                    timeout: opts.timeout,
                    metadata: opts.metadata.clone(),
                };
                let established = target.provider.execute_streaming(request, &provider_opts).await;

                let mut inner = match established {
                    Ok(inner) => inner,
                    Err(err) => {
                        target.in_flight.fetch_sub(1, Ordering::Relaxed);
                        target.record_failure();
                        if classify_of(&err) == ErrorClass::Fatal || attempt >= self.max_retries {
                            yield Err(err);
                            return;
                        }
                        jittered_backoff(attempt).await;
                        continue;
                    }
                };

                let mut yielded_any = false;
                let mut retry_after_inner = false;
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(chunk) => {
                            yielded_any = true;
                            yield Ok(chunk);
                        }
                        Err(err) => {
                            if yielded_any {
                                target.in_flight.fetch_sub(1, Ordering::Relaxed);
                                target.record_failure();
                                yield Err(err);
                                return;
                            }
                            target.in_flight.fetch_sub(1, Ordering::Relaxed);
                            target.record_failure();
                            if classify_of(&err) == ErrorClass::Fatal || attempt >= self.max_retries {
                                yield Err(err);
                                return;
                            }
                            jittered_backoff(attempt).await;
                            retry_after_inner = true;
                            break;
                        }
                    }
                }
                if retry_after_inner {
                    continue;
                }
                target.in_flight.fetch_sub(1, Ordering::Relaxed);
                target.record_success();
                return;
            }
        }
    }

    pub async fn health_check(&self) -> HealthState {
        let mut any_healthy = false;
        for target in &self.targets {
            let result = target.provider.health_check().await;
            target.apply_health_check(result.status);
            if result.status == HealthState::Healthy {
                any_healthy = true;
            }
        }
        if any_healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }
}

fn classify_of(err: &GatewayError) -> ErrorClass {
    match err {
        GatewayError::Provider { class, .. } => *class,
        GatewayError::Timeout { .. } => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

/// Exponential backoff with jitter.
async fn jittered_backoff(attempt: u32) {
    let base_ms = 100u64.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4 + 1);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
}

/// Classifies a raw cause string from a failed provider call, combining
/// `classify_provider_error` with the crate error taxonomy.
pub fn classify_cause(provider_id: &str, attempt: u32, cause: impl std::fmt::Display) -> GatewayError {
    let message = cause.to_string();
    let class = classify_provider_error(&message);
    GatewayError::from_provider_failure(provider_id, attempt, class, message)
}
