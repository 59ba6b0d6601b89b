//! End-to-end tests exercising assembler -> scheduler -> engine as a whole,
//! covering the concrete scenarios spelled out for this routing core.
//!
//! **Requirements:** none — this crate has no external service dependencies;
//! provider transports are faked in-process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_router_core::assembler::PipelineAssembler;
use gateway_router_core::config::{AuthConfig, GatewayConfig, PipelineTable, PipelineTableEntry, ProviderConfig};
use gateway_router_core::error::GatewayError;
use gateway_router_core::provider::{
    ExecuteOpts, HealthCheckResult, HealthState, Provider, ProviderInfo, ProviderResponse, StreamChunk,
};
use gateway_router_core::request::{Content, ContentPart, Message, Request, Role};
use gateway_router_core::scheduler::SchedulerManager;

struct FakeProvider {
    name: String,
    remaining_failures: std::sync::atomic::AtomicUsize,
}

impl FakeProvider {
    fn healthy(name: &str) -> Self {
        FakeProvider {
            name: name.to_string(),
            remaining_failures: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn failing(name: &str, failures: usize) -> Self {
        FakeProvider {
            name: name.to_string(),
            remaining_failures: std::sync::atomic::AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn execute(&self, _request: &Request, _opts: &ExecuteOpts) -> Result<ProviderResponse, GatewayError> {
        let remaining = self.remaining_failures.load(std::sync::atomic::Ordering::Relaxed);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            return Err(GatewayError::from_provider_failure(
                &self.name,
                1,
                gateway_router_core::error::ErrorClass::Retryable,
                "simulated network error",
            ));
        }
        Ok(ProviderResponse {
            content: serde_json::json!({"text": format!("response from {}", self.name)}),
            finish_reason: Some("stop".into()),
            usage: None,
        })
    }

    async fn execute_streaming(
        &self,
        _request: &Request,
        _opts: &ExecuteOpts,
    ) -> Result<gateway_router_core::provider::ProviderStream, GatewayError> {
        Ok(Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk { delta: serde_json::json!({"text": "Hel"}), is_final: false }),
            Ok(StreamChunk { delta: serde_json::json!({"text": "lo"}), is_final: true }),
        ])))
    }

    async fn health_check(&self) -> HealthCheckResult {
        HealthCheckResult { status: HealthState::Healthy, details: None }
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            provider_type: "fake".into(),
            supported_models: vec!["x".into()],
            default_model: Some("x".into()),
        }
    }

    fn configured_for(&self, _model_id: &str, _key_index: usize, _routing_id: &str) -> Arc<dyn Provider> {
        Arc::new(FakeProvider::healthy(&self.name))
    }
}

fn provider_config(endpoint: &str) -> ProviderConfig {
    ProviderConfig {
        provider_type: "openai_compat".into(),
        endpoint: endpoint.into(),
        models: HashMap::new(),
        auth: AuthConfig { keys: vec!["test-key".into()] },
        name: None,
    }
}

fn entry(routing_id: &str, provider_id: &str, priority: i32, weight: f64) -> PipelineTableEntry {
    PipelineTableEntry {
        routing_id: routing_id.into(),
        provider_id: provider_id.into(),
        model_id: "gpt-4o".into(),
        key_index: 0,
        priority,
        enabled: true,
        weight: Some(weight),
        strategy: None,
    }
}

fn base_config(entries: Vec<PipelineTableEntry>) -> GatewayConfig {
    GatewayConfig {
        providers: HashMap::from([
            ("provider-a".to_string(), provider_config("https://a.example.test")),
            ("provider-b".to_string(), provider_config("https://b.example.test")),
        ]),
        pipeline_table: PipelineTable { entries },
        routing_rules: vec![],
        strategies: vec![],
        routing_capabilities: HashMap::new(),
        health_check_interval_secs: 3600,
        default_timeout_secs: 5,
        default_max_retries: 3,
        default_strategy: "balanced".into(),
        max_alternatives: 3,
        enable_fallback: true,
        engine_enabled: true,
    }
}

fn chat_request(text: &str) -> Request {
    Request {
        messages: Some(vec![Message { role: Role::User, content: Some(Content::Text(text.to_string())) }]),
        model: Some("gpt-4o".into()),
        ..Default::default()
    }
}

mod chat_with_no_specials {
    use super::*;

    #[tokio::test]
    async fn plain_chat_routes_to_the_single_available_pool() {
        let config = base_config(vec![entry("default", "provider-a", 60, 1.0)]);
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("provider-a".to_string(), Arc::new(FakeProvider::healthy("provider-a")) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        let response = scheduler.handle(&chat_request("hi")).await.unwrap();
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }
}

mod vision_required_fallback {
    use super::*;

    #[tokio::test]
    async fn image_request_falls_back_when_no_vision_pool_exists() {
        let config = base_config(vec![entry("default", "provider-a", 60, 1.0)]);
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("provider-a".to_string(), Arc::new(FakeProvider::healthy("provider-a")) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        let mut request = chat_request("describe this image");
        request.messages.as_mut().unwrap().push(Message {
            role: Role::User,
            content: Some(Content::Parts(vec![ContentPart::ImageUrl {
                image_url: serde_json::json!({"url": "http://example.com/a.png"}),
            }])),
        });

        // provider-a's inferred capabilities don't declare vision support, so
        // the only path to a decision is the availability-based fallback.
        let response = scheduler.handle(&request).await.unwrap();
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }
}

mod streaming {
    use super::*;

    #[tokio::test]
    async fn streaming_request_yields_chunks_in_provider_order() {
        let config = base_config(vec![entry("default", "provider-a", 60, 1.0)]);
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("provider-a".to_string(), Arc::new(FakeProvider::healthy("provider-a")) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        let mut request = chat_request("stream this");
        request.stream = true;

        let chunks = scheduler.handle_streaming(&request).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_final);
        assert!(chunks[1].is_final);
    }

    struct MidStreamFailingProvider {
        name: String,
    }

    #[async_trait]
    impl Provider for MidStreamFailingProvider {
        async fn execute(&self, _request: &Request, _opts: &ExecuteOpts) -> Result<ProviderResponse, GatewayError> {
            unimplemented!("not exercised in this test")
        }

        async fn execute_streaming(
            &self,
            _request: &Request,
            _opts: &ExecuteOpts,
        ) -> Result<gateway_router_core::provider::ProviderStream, GatewayError> {
            let err = GatewayError::from_provider_failure(
                &self.name,
                1,
                gateway_router_core::error::ErrorClass::Retryable,
                "stream dropped mid-response",
            );
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(StreamChunk { delta: serde_json::json!({"text": "Hel"}), is_final: false }),
                Err(err),
            ])))
        }

        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult { status: HealthState::Healthy, details: None }
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: self.name.clone(),
                provider_type: "fake".into(),
                supported_models: vec!["x".into()],
                default_model: Some("x".into()),
            }
        }

        fn configured_for(&self, _model_id: &str, _key_index: usize, _routing_id: &str) -> Arc<dyn Provider> {
            Arc::new(MidStreamFailingProvider { name: self.name.clone() })
        }
    }

    #[tokio::test]
    async fn failure_after_first_chunk_is_not_retried_on_a_second_target() {
        let config = base_config(vec![
            entry("default", "provider-a", 60, 1.0),
            entry("default", "provider-b", 60, 1.0),
        ]);
        let registry: HashMap<String, Arc<dyn Provider>> = HashMap::from([
            ("provider-a".to_string(), Arc::new(MidStreamFailingProvider { name: "provider-a".into() }) as Arc<dyn Provider>),
            ("provider-b".to_string(), Arc::new(FakeProvider::healthy("provider-b")) as Arc<dyn Provider>),
        ]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        let mut request = chat_request("stream this");
        request.stream = true;

        // Target selection is lexical by id, so "provider-a" (which drops
        // mid-stream) is always tried first; the failure must surface
        // directly rather than silently failing over to "provider-b".
        let err = scheduler.handle_streaming(&request).await.unwrap_err();
        match err {
            GatewayError::Provider { provider_id, .. } => assert_eq!(provider_id, "provider-a"),
            other => panic!("expected a provider error from provider-a, got {other:?}"),
        }
    }
}

mod health_check {
    use super::*;

    #[tokio::test]
    async fn health_check_request_reports_pool_health_without_dispatching_a_chat_call() {
        let config = base_config(vec![entry("default", "provider-a", 60, 1.0)]);
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("provider-a".to_string(), Arc::new(FakeProvider::healthy("provider-a")) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        let mut request = chat_request("ping");
        request.request_type = Some("health_check".into());

        let response = scheduler.handle(&request).await.unwrap();
        assert_eq!(response.finish_reason.as_deref(), Some("health_check"));
        assert_eq!(response.content, serde_json::json!({"healthy": true}));
    }
}

mod retry_exhaustion {
    use super::*;

    #[tokio::test]
    async fn all_targets_failing_surfaces_the_final_provider_error() {
        let config = base_config(vec![
            entry("default", "provider-a", 60, 1.0),
            entry("default", "provider-b", 60, 1.0),
        ]);
        let registry: HashMap<String, Arc<dyn Provider>> = HashMap::from([
            ("provider-a".to_string(), Arc::new(FakeProvider::failing("provider-a", 10)) as Arc<dyn Provider>),
            ("provider-b".to_string(), Arc::new(FakeProvider::failing("provider-b", 10)) as Arc<dyn Provider>),
        ]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        let err = scheduler.handle(&chat_request("hi")).await.unwrap_err();
        match err {
            GatewayError::Provider { attempt, .. } => assert_eq!(attempt, 3),
            other => panic!("expected a provider error after retry exhaustion, got {other:?}"),
        }
    }
}

mod hot_reload {
    use super::*;

    #[tokio::test]
    async fn adding_and_removing_routing_classes_updates_the_pool_set() {
        let config = base_config(vec![
            entry("default", "provider-a", 60, 1.0),
            entry("vision", "provider-b", 80, 1.0),
        ]);
        let registry: HashMap<String, Arc<dyn Provider>> = HashMap::from([
            ("provider-a".to_string(), Arc::new(FakeProvider::healthy("provider-a")) as Arc<dyn Provider>),
            ("provider-b".to_string(), Arc::new(FakeProvider::healthy("provider-b")) as Arc<dyn Provider>),
        ]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;

        // Exercise "default" once to populate its metrics before reload.
        scheduler.handle(&chat_request("hi")).await.unwrap();
        let before = scheduler.get_pool_snapshot("default").await.unwrap();
        assert_eq!(before.metrics.total, 1);

        let new_config = base_config(vec![
            entry("default", "provider-a", 60, 1.0),
            entry("long_context", "provider-b", 80, 1.0),
        ]);
        let new_assembly = assembler.assemble(&new_config).unwrap();
        scheduler.hot_reload(new_assembly).await;

        assert!(scheduler.get_pool_snapshot("long_context").await.is_some());
        assert!(scheduler.get_pool_snapshot("vision").await.is_none());
        let after = scheduler.get_pool_snapshot("default").await.unwrap();
        assert_eq!(after.metrics.total, 1, "kept pool's metrics carry over across reload");
    }
}

mod destroy_lifecycle {
    use super::*;

    #[tokio::test]
    async fn handle_after_destroy_raises_uninitialised() {
        let config = base_config(vec![entry("default", "provider-a", 60, 1.0)]);
        let registry: HashMap<String, Arc<dyn Provider>> =
            HashMap::from([("provider-a".to_string(), Arc::new(FakeProvider::healthy("provider-a")) as Arc<dyn Provider>)]);
        let assembler = PipelineAssembler::new(registry);
        let assembly = assembler.assemble(&config).unwrap();

        let scheduler = Arc::new(SchedulerManager::new(&config, None));
        scheduler.initialize(assembly).await;
        scheduler.destroy().await;

        let err = scheduler.handle(&chat_request("hi")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Uninitialised));
    }
}
