//! PipelinePool: a passive holder of pipelines for one routing class.

use std::collections::HashMap;

use crate::capability::RoutingCapabilities;
use crate::metrics::PoolMetrics;
use crate::pipeline::Pipeline;
use crate::provider::HealthState;

/// `active` is the first pipeline inserted and stays stable (§4.3).
pub struct PipelinePool {
    pub routing_id: String,
    pipelines: HashMap<String, Pipeline>,
    active_id: Option<String>,
    pub metrics: PoolMetrics,
    pub routing_capabilities: RoutingCapabilities,
    health: std::sync::atomic::AtomicBool,
}

impl PipelinePool {
    pub fn new(routing_id: impl Into<String>, routing_capabilities: RoutingCapabilities) -> Self {
        PipelinePool {
            routing_id: routing_id.into(),
            pipelines: HashMap::new(),
            active_id: None,
            metrics: PoolMetrics::default(),
            routing_capabilities,
            health: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Inserts a pipeline; the first insertion becomes `active` and stays
    /// so regardless of later insertions.
    pub fn insert_pipeline(&mut self, pipeline: Pipeline) {
        if self.active_id.is_none() {
            self.active_id = Some(pipeline.id.clone());
        }
        self.pipelines.insert(pipeline.id.clone(), pipeline);
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn active(&self) -> Option<&Pipeline> {
        self.active_id.as_ref().and_then(|id| self.pipelines.get(id))
    }

    pub fn is_healthy(&self) -> bool {
        self.health.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn run_health_check(&self) {
        if let Some(active) = self.active() {
            let status = active.health_check().await;
            self.health
                .store(status == HealthState::Healthy, std::sync::atomic::Ordering::Relaxed);
        }
    }
}
