//! PipelineAssembler: builds a static fleet of pipeline pools from a
//! declarative config and a pre-built provider registry.
//!
//! Grounded on table-driven target construction from a declarative upstream
//! list, generalized to the pipeline-table model (§9) over the alternative
//! "virtualModel" formulation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::capability::RoutingCapabilities;
use crate::config::GatewayConfig;
use crate::pipeline::{LoadBalancingAlgorithm, Pipeline, Target};
use crate::pool::PipelinePool;
use crate::provider::Provider;

/// Maps a pipeline-table entry's `strategy` name onto a load-balancing
/// algorithm, defaulting to round-robin when unset or unrecognised.
fn load_balancing_algorithm_for(name: Option<&String>) -> LoadBalancingAlgorithm {
    match name.map(|s| s.as_str()) {
        Some("weighted") => LoadBalancingAlgorithm::Weighted,
        Some("random") => LoadBalancingAlgorithm::Random,
        Some("least_connections") => LoadBalancingAlgorithm::LeastConnections,
        _ => LoadBalancingAlgorithm::RoundRobin,
    }
}

pub struct AssemblyResult {
    pub pools: HashMap<String, PipelinePool>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct PipelineAssembler {
    registry: HashMap<String, Arc<dyn Provider>>,
}

impl PipelineAssembler {
    pub fn new(registry: HashMap<String, Arc<dyn Provider>>) -> Self {
        PipelineAssembler { registry }
    }

    /// `assemble(config) -> AssemblyResult` (§4.4).
    pub fn assemble(&self, config: &GatewayConfig) -> Result<AssemblyResult, String> {
        if self.registry.is_empty() {
            return Err("assembly failed: provider registry is empty".to_string());
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut grouped: HashMap<String, Vec<Arc<Target>>> = HashMap::new();
        let mut strategies: HashMap<String, String> = HashMap::new();

        for entry in &config.pipeline_table.entries {
            let Some(base_provider) = self.registry.get(&entry.provider_id) else {
                warnings.push(format!(
                    "pipeline table entry for routing class '{}' references unknown provider '{}', skipped",
                    entry.routing_id, entry.provider_id
                ));
                continue;
            };

            // First entry's strategy wins for a given routing class.
            if let Some(strategy) = &entry.strategy {
                strategies.entry(entry.routing_id.clone()).or_insert_with(|| strategy.clone());
            }

            // Step 2: clone the base provider into a configured provider
            // scoped to this single (model, key) permutation.
            let configured = base_provider.configured_for(&entry.model_id, entry.key_index, &entry.routing_id);
            let target_id = format!("{}:{}:{}", entry.provider_id, entry.model_id, entry.key_index);
            let target = Arc::new(Target::new(
                target_id,
                configured,
                entry.provider_id.clone(),
                entry.model_id.clone(),
                entry.key_index,
                entry.weight.unwrap_or(1.0),
                entry.enabled,
            ));

            grouped.entry(entry.routing_id.clone()).or_default().push(target);
        }

        let mut pools = HashMap::new();

        for (routing_id, targets) in grouped {
            let capabilities = self.capabilities_for(&routing_id, config, &targets);
            if let Err(reason) = capabilities.validate() {
                errors.push(format!("routing class '{routing_id}': invalid capabilities: {reason}"));
                continue;
            }

            let mut pool = PipelinePool::new(routing_id.clone(), capabilities);
            let load_balancing = load_balancing_algorithm_for(strategies.get(&routing_id));
            let pipeline = Pipeline::new(
                format!("{routing_id}-pipeline"),
                targets,
                load_balancing,
                config.health_check_interval(),
                config.default_max_retries,
                config.default_timeout(),
            );
            pool.insert_pipeline(pipeline);
            pools.insert(routing_id, pool);
        }

        // Step 5: routing classes declared in routing_capabilities but with
        // no pipeline-table entries get a descriptive-error fallback pool,
        // seeded from the first available provider.
        for routing_id in config.routing_capabilities.keys() {
            if pools.contains_key(routing_id) {
                continue;
            }
            warnings.push(format!(
                "routing class '{routing_id}' has no pipeline-table entries; synthesising fallback pipeline"
            ));
            if let Some((provider_id, provider)) = self.registry.iter().next() {
                let capabilities = self.capabilities_for(routing_id, config, &[]);
                let mut pool = PipelinePool::new(routing_id.clone(), capabilities);
                let target = Arc::new(Target::new(
                    format!("{provider_id}:fallback:0"),
                    Arc::clone(provider),
                    provider_id.clone(),
                    "fallback",
                    0,
                    1.0,
                    false,
                ));
                let load_balancing = load_balancing_algorithm_for(strategies.get(routing_id));
                let pipeline = Pipeline::new(
                    format!("{routing_id}-fallback-pipeline"),
                    vec![target],
                    load_balancing,
                    config.health_check_interval(),
                    config.default_max_retries,
                    config.default_timeout(),
                );
                pool.insert_pipeline(pipeline);
                pools.insert(routing_id.clone(), pool);
            }
        }

        if pools.is_empty() {
            errors.push("assembly produced zero pools with at least one pipeline".to_string());
        }

        for (id, pool) in &pools {
            if pool.is_empty() {
                warnings.push(format!("pool '{id}' has no pipelines"));
            }
        }

        if !errors.is_empty() && pools.is_empty() {
            warn!(errors = ?errors, "assembly failed globally");
        }

        Ok(AssemblyResult { pools, errors, warnings })
    }

    fn capabilities_for(
        &self,
        routing_id: &str,
        config: &GatewayConfig,
        targets: &[Arc<Target>],
    ) -> RoutingCapabilities {
        let model_hint = targets
            .first()
            .map(|t| t.model_id.clone())
            .unwrap_or_else(|| routing_id.to_string());
        let base = RoutingCapabilities::inferred_default(&model_hint);
        match config.routing_capabilities.get(routing_id) {
            Some(declared) => declared.overlay.clone().apply_onto(base),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, PipelineTable, PipelineTableEntry, ProviderConfig};
    use crate::provider::{ExecuteOpts, HealthCheckResult, HealthState, ProviderInfo, ProviderResponse};
    use crate::request::Request;
    use async_trait::async_trait;

    struct FakeProvider(String);

    #[async_trait]
    impl Provider for FakeProvider {
        async fn execute(&self, _r: &Request, _o: &ExecuteOpts) -> Result<ProviderResponse, crate::error::GatewayError> {
            Ok(ProviderResponse {
                content: serde_json::json!({}),
                finish_reason: None,
                usage: None,
            })
        }
        async fn execute_streaming(
            &self,
            _r: &Request,
            _o: &ExecuteOpts,
        ) -> Result<crate::provider::ProviderStream, crate::error::GatewayError> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult { status: HealthState::Healthy, details: None }
        }
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: self.0.clone(),
                provider_type: "fake".into(),
                supported_models: vec![],
                default_model: None,
            }
        }
        fn configured_for(&self, _model_id: &str, _key_index: usize, _routing_id: &str) -> Arc<dyn Provider> {
            Arc::new(FakeProvider(self.0.clone()))
        }
    }

    fn config_with_one_entry() -> GatewayConfig {
        GatewayConfig {
            providers: HashMap::from([(
                "p1".to_string(),
                ProviderConfig {
                    provider_type: "openai_compat".into(),
                    endpoint: "https://example.test".into(),
                    models: HashMap::new(),
                    auth: AuthConfig { keys: vec!["k".into()] },
                    name: None,
                },
            )]),
            pipeline_table: PipelineTable {
                entries: vec![PipelineTableEntry {
                    routing_id: "default".into(),
                    provider_id: "p1".into(),
                    model_id: "gpt-4o".into(),
                    key_index: 0,
                    priority: 0,
                    enabled: true,
                    weight: Some(1.0),
                    strategy: None,
                }],
            },
            routing_rules: vec![],
            strategies: vec![],
            routing_capabilities: HashMap::new(),
            health_check_interval_secs: 30,
            default_timeout_secs: 30,
            default_max_retries: 3,
            default_strategy: "balanced".into(),
            max_alternatives: 3,
            enable_fallback: true,
            engine_enabled: true,
        }
    }

    #[test]
    fn assembles_one_pool_from_one_entry() {
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("p1".to_string(), Arc::new(FakeProvider("p1".into())) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let result = assembler.assemble(&config_with_one_entry()).unwrap();
        assert_eq!(result.pools.len(), 1);
        assert!(result.pools.contains_key("default"));
        assert!(result.pools["default"].active().is_some());
    }

    #[test]
    fn empty_registry_is_a_fatal_error() {
        let assembler = PipelineAssembler::new(HashMap::new());
        assert!(assembler.assemble(&config_with_one_entry()).is_err());
    }

    #[test]
    fn unknown_provider_reference_is_a_warning_not_fatal() {
        let mut config = config_with_one_entry();
        config.pipeline_table.entries[0].provider_id = "does-not-exist".into();
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("p1".to_string(), Arc::new(FakeProvider("p1".into())) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let result = assembler.assemble(&config).unwrap();
        assert!(!result.warnings.is_empty());
        assert!(result.pools.is_empty());
    }

    #[test]
    fn pipeline_table_strategy_selects_the_load_balancing_algorithm() {
        let mut config = config_with_one_entry();
        config.pipeline_table.entries[0].strategy = Some("weighted".into());
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("p1".to_string(), Arc::new(FakeProvider("p1".into())) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let result = assembler.assemble(&config).unwrap();
        let pipeline = result.pools["default"].active().unwrap();
        assert_eq!(pipeline.load_balancing, LoadBalancingAlgorithm::Weighted);
    }

    #[test]
    fn missing_strategy_defaults_to_round_robin() {
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("p1".to_string(), Arc::new(FakeProvider("p1".into())) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let result = assembler.assemble(&config_with_one_entry()).unwrap();
        let pipeline = result.pools["default"].active().unwrap();
        assert_eq!(pipeline.load_balancing, LoadBalancingAlgorithm::RoundRobin);
    }
}
