//! Declared per-pool routing capabilities, consulted by the routing engine
//! on every decision.
//!
//! Grounded on the capability-declaration shape used across the pack's
//! `RequestCapabilities`/`ModelCapabilities`/`ConnectorCapabilities` triad —
//! collapsed here into a single `RoutingCapabilities` struct, since this
//! crate doesn't separate request-side from connector-side capability
//! declarations.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Sentinel for "no effective cap" — `maxTokens` is advisory only (§9);
/// the provider enforces its own limit.
pub const UNLIMITED_TOKENS: u64 = u64::MAX;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLimits {
    pub requests_per_minute: Option<u64>,
    pub tokens_per_minute: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingCapabilities {
    pub supported_models: HashSet<String>,
    pub max_tokens: u64,
    pub streaming: bool,
    pub tools: bool,
    pub images: bool,
    pub function_calling: bool,
    pub multimodal: bool,
    pub supported_modalities: HashSet<String>,
    /// 0..=100
    pub priority: u32,
    pub availability: f64,
    pub load_weight: f64,
    pub cost_score: f64,
    pub performance_score: f64,
    pub routing_tags: HashSet<String>,
    pub region_restrictions: Option<HashSet<String>>,
    pub usage_limits: Option<UsageLimits>,
}

impl RoutingCapabilities {
    /// Conservative defaults synthesised when a routing class declares no
    /// explicit capabilities (§4.4 step 4).
    pub fn inferred_default(model_hint: &str) -> Self {
        let lower = model_hint.to_lowercase();
        let vision = lower.contains("vision") || lower.contains("4o") || lower.contains("gemini");
        let mut modalities = HashSet::from(["text".to_string()]);
        if vision {
            modalities.insert("vision".to_string());
        }
        RoutingCapabilities {
            supported_models: HashSet::from([model_hint.to_string()]),
            max_tokens: UNLIMITED_TOKENS,
            streaming: true,
            tools: lower.contains("gpt") || lower.contains("claude"),
            images: vision,
            function_calling: lower.contains("gpt") || lower.contains("claude"),
            multimodal: vision,
            supported_modalities: modalities,
            priority: 50,
            availability: 0.9,
            load_weight: 1.0,
            cost_score: 0.5,
            performance_score: 0.5,
            routing_tags: HashSet::new(),
            region_restrictions: None,
            usage_limits: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("availability", self.availability),
            ("load_weight", self.load_weight),
            ("cost_score", self.cost_score),
            ("performance_score", self.performance_score),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{name} must be in [0,1], got {v}"));
            }
        }
        if self.priority > 100 {
            return Err(format!("priority must be in [0,100], got {}", self.priority));
        }
        if !self.supported_modalities.contains("text") && self.supported_modalities.is_empty() {
            return Err("supported_modalities must contain 'text' unless pool is non-text-only".into());
        }
        Ok(())
    }
}

/// Optional per-routing-class declaration overlay from config, merged onto
/// an inferred default where fields are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingCapabilitiesOverlay {
    pub supported_models: Option<HashSet<String>>,
    pub max_tokens: Option<u64>,
    pub streaming: Option<bool>,
    pub tools: Option<bool>,
    pub images: Option<bool>,
    pub function_calling: Option<bool>,
    pub multimodal: Option<bool>,
    pub supported_modalities: Option<HashSet<String>>,
    pub priority: Option<u32>,
    pub availability: Option<f64>,
    pub load_weight: Option<f64>,
    pub cost_score: Option<f64>,
    pub performance_score: Option<f64>,
    pub routing_tags: Option<HashSet<String>>,
    pub region_restrictions: Option<HashSet<String>>,
    pub usage_limits: Option<UsageLimits>,
    #[serde(skip)]
    _extra: Option<HashMap<String, ()>>,
}

impl RoutingCapabilitiesOverlay {
    pub fn apply_onto(self, base: RoutingCapabilities) -> RoutingCapabilities {
        RoutingCapabilities {
            supported_models: self.supported_models.unwrap_or(base.supported_models),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            streaming: self.streaming.unwrap_or(base.streaming),
            tools: self.tools.unwrap_or(base.tools),
            images: self.images.unwrap_or(base.images),
            function_calling: self.function_calling.unwrap_or(base.function_calling),
            multimodal: self.multimodal.unwrap_or(base.multimodal),
            supported_modalities: self.supported_modalities.unwrap_or(base.supported_modalities),
            priority: self.priority.unwrap_or(base.priority),
            availability: self.availability.unwrap_or(base.availability),
            load_weight: self.load_weight.unwrap_or(base.load_weight),
            cost_score: self.cost_score.unwrap_or(base.cost_score),
            performance_score: self.performance_score.unwrap_or(base.performance_score),
            routing_tags: self.routing_tags.unwrap_or(base.routing_tags),
            region_restrictions: self.region_restrictions.or(base.region_restrictions),
            usage_limits: self.usage_limits.or(base.usage_limits),
        }
    }
}
