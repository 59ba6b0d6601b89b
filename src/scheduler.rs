//! SchedulerManager: the central fixture. Owns pools, drives the analyser
//! and engine, executes decisions, tracks metrics, and runs the periodic
//! health-check loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::analyzer::RequestAnalyzer;
use crate::assembler::AssemblyResult;
use crate::config::GatewayConfig;
use crate::engine::RoutingRulesEngine;
use crate::error::GatewayError;
use crate::metrics::GlobalMetrics;
use crate::observer::{NoopObserver, SharedObserver};
use crate::pipeline::ExecuteRequestOpts;
use crate::pool::PipelinePool;
use crate::provider::{ProviderResponse, StreamChunk};
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Chat,
    StreamChat,
    HealthCheck,
}

fn operation_for(request: &Request) -> Operation {
    if request.request_type.as_deref() == Some("health_check") {
        Operation::HealthCheck
    } else if request.stream {
        Operation::StreamChat
    } else {
        Operation::Chat
    }
}

pub struct ExecuteOpts {
    pub timeout: Duration,
    pub priority: Option<crate::request::Priority>,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct PoolSnapshot {
    pub routing_id: String,
    pub is_healthy: bool,
    pub metrics: crate::metrics::PoolMetricsSnapshot,
}

pub struct SchedulerManager {
    pools: RwLock<HashMap<String, PipelinePool>>,
    analyzer: RequestAnalyzer,
    engine: RoutingRulesEngine,
    metrics: GlobalMetrics,
    observer: SharedObserver,
    initialized: AtomicBool,
    default_timeout: Duration,
    default_strategy: String,
    engine_enabled: bool,
    health_check_interval: Duration,
    health_timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerManager {
    pub fn new(config: &GatewayConfig, observer: Option<SharedObserver>) -> Self {
        let engine = RoutingRulesEngine::new(config.enable_fallback, config.max_alternatives);
        for rule in &config.routing_rules {
            engine.add_rule(rule.clone());
        }
        for strategy in &config.strategies {
            engine.add_strategy(strategy.clone());
        }
        SchedulerManager {
            pools: RwLock::new(HashMap::new()),
            analyzer: RequestAnalyzer::default(),
            engine,
            metrics: GlobalMetrics::default(),
            observer: observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            initialized: AtomicBool::new(false),
            default_timeout: config.default_timeout(),
            default_strategy: config.default_strategy.clone(),
            engine_enabled: config.engine_enabled,
            health_check_interval: config.health_check_interval(),
            health_timer: std::sync::Mutex::new(None),
        }
    }

    /// Diagnostic: rule names currently registered with the engine,
    /// defaults plus whatever the config overlaid.
    pub fn engine_rule_names(&self) -> Vec<String> {
        self.engine.rule_names()
    }

    /// Diagnostic: strategy names currently registered with the engine.
    pub fn engine_strategy_names(&self) -> Vec<String> {
        self.engine.strategy_names()
    }

    /// `initialize(pools)` (§4.5): install pools, register capabilities
    /// with the engine, arm the health-check timer, mark initialised.
    /// Idempotent — reinvocation replaces pools (hot-reload uses this).
    pub async fn initialize(self: &Arc<Self>, assembly: AssemblyResult) {
        for (id, pool) in &assembly.pools {
            self.engine.register_pool(id.clone(), pool.routing_capabilities.clone());
        }
        for warning in &assembly.warnings {
            warn!(%warning, "assembly warning");
        }
        {
            let mut pools = self.pools.write().await;
            *pools = assembly.pools;
        }
        self.initialized.store(true, Ordering::SeqCst);
        self.arm_health_timer();
        info!(pool_count = self.engine.pool_count(), "scheduler initialised");
    }

    fn arm_health_timer(self: &Arc<Self>) {
        let mut guard = self.health_timer.lock().expect("health timer mutex poisoned");
        if let Some(existing) = guard.take() {
            existing.abort();
        }
        let scheduler = Arc::clone(self);
        let interval = self.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                scheduler.run_health_checks().await;
                scheduler.engine.sweep_rule_cache();
            }
        });
        *guard = Some(handle);
    }

    async fn run_health_checks(&self) {
        let pools = self.pools.read().await;
        for (id, pool) in pools.iter() {
            pool.run_health_check().await;
            self.observer.on_health_check(id, pool.is_healthy());
        }
    }

    fn require_initialized(&self) -> Result<(), GatewayError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::Uninitialised)
        }
    }

    /// `handle(request, context?) -> response` (§4.5).
    #[instrument(skip(self, request))]
    pub async fn handle(&self, request: &Request) -> Result<ProviderResponse, GatewayError> {
        self.require_initialized()?;
        let routing_id = self.route(request).await?;
        let operation = operation_for(request);
        let opts = ExecuteOpts {
            timeout: self.default_timeout,
            priority: None,
            metadata: HashMap::new(),
        };
        match operation {
            Operation::StreamChat => Err(GatewayError::Internal(anyhow::anyhow!(
                "streaming requests must call handle_streaming, not handle"
            ))),
            Operation::Chat | Operation::HealthCheck => {
                self.execute(&routing_id, request, operation, &opts).await
            }
        }
    }

    pub async fn handle_streaming(&self, request: &Request) -> Result<Vec<StreamChunk>, GatewayError> {
        self.require_initialized()?;
        let routing_id = self.route(request).await?;
        let opts = ExecuteOpts {
            timeout: self.default_timeout,
            priority: None,
            metadata: HashMap::new(),
        };
        self.execute_streaming(&routing_id, request, &opts).await
    }

    async fn route(&self, request: &Request) -> Result<String, GatewayError> {
        if self.engine_enabled {
            let analysis = self.analyzer.analyse(request, None);
            let decision = self.engine.decide(&analysis, Some(&self.default_strategy))?;
            self.observer.on_decision(
                &decision.target_routing_id,
                &decision.selected_pool_id,
                decision.match_result.match_score,
                decision.metadata.fallback_used,
            );
            Ok(decision.target_routing_id)
        } else {
            let pools = self.pools.read().await;
            if pools.contains_key("default") {
                Ok("default".to_string())
            } else {
                pools
                    .keys()
                    .next()
                    .cloned()
                    .ok_or(GatewayError::RoutingNotFound {
                        routing_id: "default".to_string(),
                    })
            }
        }
    }

    /// `execute(routingId, request, operation, opts)` (§4.5). `HealthCheck`
    /// runs the pool's active-pipeline health check instead of dispatching
    /// the request, and reports it back as a synthetic response.
    pub async fn execute(
        &self,
        routing_id: &str,
        request: &Request,
        operation: Operation,
        opts: &ExecuteOpts,
    ) -> Result<ProviderResponse, GatewayError> {
        let start = Instant::now();
        let pools = self.pools.read().await;
        let pool = pools.get(routing_id).ok_or(GatewayError::RoutingNotFound {
            routing_id: routing_id.to_string(),
        })?;

        if operation == Operation::HealthCheck {
            pool.run_health_check().await;
            let healthy = pool.is_healthy();
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            pool.metrics.record(healthy, duration_ms);
            self.metrics.record(healthy);
            self.observer.on_health_check(routing_id, healthy);
            return Ok(ProviderResponse {
                content: serde_json::json!({ "healthy": healthy }),
                finish_reason: Some("health_check".to_string()),
                usage: None,
            });
        }

        let pipeline = pool.active().ok_or(GatewayError::NoActivePipeline {
            pool_id: routing_id.to_string(),
        })?;
        let pipeline_opts = ExecuteRequestOpts {
            timeout: opts.timeout,
            metadata: opts.metadata.clone(),
        };
        let result = pipeline.execute(request, &pipeline_opts).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        pool.metrics.record(result.is_ok(), duration_ms);
        self.metrics.record(result.is_ok());
        self.observer.on_execute(routing_id, result.is_ok(), duration_ms);
        result
    }

    pub async fn execute_streaming(
        &self,
        routing_id: &str,
        request: &Request,
        opts: &ExecuteOpts,
    ) -> Result<Vec<StreamChunk>, GatewayError> {
        let start = Instant::now();
        let pools = self.pools.read().await;
        let pool = pools.get(routing_id).ok_or(GatewayError::RoutingNotFound {
            routing_id: routing_id.to_string(),
        })?;
        let pipeline = pool.active().ok_or(GatewayError::NoActivePipeline {
            pool_id: routing_id.to_string(),
        })?;
        let pipeline_opts = ExecuteRequestOpts {
            timeout: opts.timeout,
            metadata: opts.metadata.clone(),
        };

        let mut stream = Box::pin(pipeline.execute_streaming(request, &pipeline_opts));
        let mut chunks = Vec::new();
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let success = failure.is_none();
        pool.metrics.record(success, duration_ms);
        self.metrics.record(success);
        self.observer.on_execute(routing_id, success, duration_ms);
        match failure {
            Some(err) => Err(err),
            None => Ok(chunks),
        }
    }

    /// `hotReload(newPools)` (§4.5): compute `{add, keep, remove}` by
    /// routingId; drop-then-insert for `keep` so in-flight requests that
    /// already captured a pipeline handle continue to completion; metrics
    /// for kept pools are preserved by not touching their `PipelinePool`.
    pub async fn hot_reload(&self, new_assembly: AssemblyResult) {
        let mut pools = self.pools.write().await;
        let existing_ids: HashSet<String> = pools.keys().cloned().collect();
        let new_ids: HashSet<String> = new_assembly.pools.keys().cloned().collect();

        for removed_id in existing_ids.difference(&new_ids) {
            pools.remove(removed_id);
            self.engine.deregister_pool(removed_id);
        }

        for (id, new_pool) in new_assembly.pools {
            if pools.contains_key(&id) {
                // keep: in-flight requests hold an `Arc<Target>`/pipeline
                // reference already cloned out of the old pool and run to
                // completion independently; replacing the map entry only
                // affects future lookups.
                self.engine.register_pool(id.clone(), new_pool.routing_capabilities.clone());
                pools.insert(id, new_pool);
            } else {
                self.engine.register_pool(id.clone(), new_pool.routing_capabilities.clone());
                pools.insert(id, new_pool);
            }
        }
        info!(pool_count = pools.len(), "hot reload complete");
    }

    pub async fn get_pool_snapshot(&self, routing_id: &str) -> Option<PoolSnapshot> {
        let pools = self.pools.read().await;
        pools.get(routing_id).map(|pool| PoolSnapshot {
            routing_id: routing_id.to_string(),
            is_healthy: pool.is_healthy(),
            metrics: pool.metrics.snapshot(),
        })
    }

    pub fn get_metrics(&self) -> (u64, u64) {
        (
            self.metrics.total_requests.load(Ordering::Relaxed),
            self.metrics.failed_requests.load(Ordering::Relaxed),
        )
    }

    /// `destroy()` (§4.5): stop the timer, mark uninitialised, drop pools.
    pub async fn destroy(&self) {
        if let Some(handle) = self.health_timer.lock().expect("health timer mutex poisoned").take() {
            handle.abort();
        }
        self.pools.write().await.clear();
        self.initialized.store(false, Ordering::SeqCst);
        info!("scheduler destroyed");
    }
}
