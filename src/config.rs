//! Declarative configuration shapes consumed directly by the
//! [`crate::assembler::PipelineAssembler`].
//!
//! File I/O and env/CLI wiring live outside this crate (§1); what's defined
//! here is the `serde::Deserialize` shape of the JSON config blocks (§6),
//! plus env-overridable defaults in the same spirit as `AILINK_*`-style
//! config loading, renamed here to `GATEWAY_*`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::capability::RoutingCapabilitiesOverlay;
use crate::rules::RoutingRule;
use crate::strategy::RoutingStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub endpoint: String,
    pub models: HashMap<String, Value>,
    pub auth: AuthConfig,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineTableEntry {
    pub routing_id: String,
    pub provider_id: String,
    pub model_id: String,
    #[serde(default)]
    pub key_index: usize,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub weight: Option<f64>,
    pub strategy: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineTable {
    pub entries: Vec<PipelineTableEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingClassCapabilities {
    #[serde(flatten)]
    pub overlay: RoutingCapabilitiesOverlay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub pipeline_table: PipelineTable,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub strategies: Vec<RoutingStrategy>,
    #[serde(default)]
    pub routing_capabilities: HashMap<String, RoutingClassCapabilities>,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_strategy_name")]
    pub default_strategy: String,
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
    #[serde(default = "default_true")]
    pub engine_enabled: bool,
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_strategy_name() -> String {
    "balanced".into()
}

fn default_max_alternatives() -> usize {
    3
}

impl GatewayConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Overlays `GATEWAY_*` environment variables onto fields that have no
    /// natural home in the declarative JSON config, mirroring an
    /// env-overridable-defaults convention.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("GATEWAY_HEALTH_CHECK_INTERVAL_SECS") {
            if let Ok(parsed) = v.parse() {
                self.health_check_interval_secs = parsed;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_DEFAULT_TIMEOUT_SECS") {
            if let Ok(parsed) = v.parse() {
                self.default_timeout_secs = parsed;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_DEFAULT_STRATEGY") {
            self.default_strategy = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_ENABLE_FALLBACK") {
            self.enable_fallback = v != "0" && v.to_lowercase() != "false";
        }
        self
    }
}
