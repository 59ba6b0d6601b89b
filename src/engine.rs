//! RoutingRulesEngine: rules, strategies, pool scoring, candidate selection,
//! fallback, and load balancing.
//!
//! Grounded on a strategy-dispatch shape (branching on `RoutingStrategy`)
//! and weighted/round-robin upstream selection, generalized from
//! per-request upstream selection to per-pool capability scoring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, instrument};

use crate::capability::RoutingCapabilities;
use crate::error::GatewayError;
use crate::pipeline::LoadBalancingAlgorithm;
use crate::request::RequestAnalysisResult;
use crate::rules::{default_rules, RoutingRule};
use crate::strategy::{default_strategies, RoutingStrategy};

const RULE_CACHE_TTL: Duration = Duration::from_secs(60);
const RULE_BONUS_PER_WEIGHT: f64 = 0.1;
const RULE_BONUS_CAP: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RoutingMatchResult {
    pub pool_id: String,
    pub match_score: f64,
    pub is_match: bool,
    pub rule_bonus: f64,
}

#[derive(Debug, Clone)]
pub struct DecisionMetadata {
    pub routing_time: Duration,
    pub strategy_used: String,
    pub decision_reason: String,
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target_routing_id: String,
    pub selected_pool_id: String,
    pub match_result: RoutingMatchResult,
    pub alternatives: Vec<RoutingMatchResult>,
    pub metadata: DecisionMetadata,
}

#[derive(Debug, Default)]
struct EngineStats {
    total_decisions: u64,
    fallback_decisions: u64,
    load_balanced_decisions: u64,
    avg_decision_time_ms: f64,
    avg_match_score: f64,
    routing_usage: HashMap<String, u64>,
}

struct RuleCacheEntry {
    fired: Vec<(String, f64)>,
    cached_at: Instant,
}

/// Stateful engine owning rules, strategies, pool capabilities, stats, and
/// a short-lived rule-evaluation cache (§4.6, §5).
pub struct RoutingRulesEngine {
    rules: Mutex<HashMap<String, RoutingRule>>,
    strategies: Mutex<HashMap<String, RoutingStrategy>>,
    pools: DashMap<String, RoutingCapabilities>,
    stats: Mutex<EngineStats>,
    rule_cache: Mutex<Option<RuleCacheEntry>>,
    decision_counter: AtomicU64,
    max_alternatives: usize,
    enable_fallback: bool,
}

impl RoutingRulesEngine {
    pub fn new(enable_fallback: bool, max_alternatives: usize) -> Self {
        let rules = default_rules().into_iter().map(|r| (r.name.clone(), r)).collect();
        let strategies = default_strategies().into_iter().map(|s| (s.name.clone(), s)).collect();
        RoutingRulesEngine {
            rules: Mutex::new(rules),
            strategies: Mutex::new(strategies),
            pools: DashMap::new(),
            stats: Mutex::new(EngineStats::default()),
            rule_cache: Mutex::new(None),
            decision_counter: AtomicU64::new(0),
            max_alternatives,
            enable_fallback,
        }
    }

    pub fn register_pool(&self, pool_id: impl Into<String>, capabilities: RoutingCapabilities) {
        self.pools.insert(pool_id.into(), capabilities);
    }

    pub fn deregister_pool(&self, pool_id: &str) {
        self.pools.remove(pool_id);
    }

    pub fn add_rule(&self, rule: RoutingRule) {
        self.rules.lock().expect("rules mutex poisoned").insert(rule.name.clone(), rule);
        *self.rule_cache.lock().expect("rule cache mutex poisoned") = None;
    }

    pub fn remove_rule(&self, name: &str) {
        self.rules.lock().expect("rules mutex poisoned").remove(name);
        *self.rule_cache.lock().expect("rule cache mutex poisoned") = None;
    }

    pub fn add_strategy(&self, strategy: RoutingStrategy) {
        self.strategies
            .lock()
            .expect("strategies mutex poisoned")
            .insert(strategy.name.clone(), strategy);
    }

    /// Rule names currently registered, defaults plus whatever was added.
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.lock().expect("rules mutex poisoned").keys().cloned().collect()
    }

    /// Strategy names currently registered, defaults plus whatever was added.
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .lock()
            .expect("strategies mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn resolve_strategy(&self, name: Option<&str>) -> Result<RoutingStrategy, GatewayError> {
        let strategies = self.strategies.lock().expect("strategies mutex poisoned");
        if let Some(name) = name {
            if let Some(s) = strategies.get(name).filter(|s| s.enabled) {
                return Ok(s.clone());
            }
        }
        if let Some(s) = strategies.values().find(|s| s.is_default && s.enabled) {
            return Ok(s.clone());
        }
        strategies
            .values()
            .find(|s| s.enabled)
            .cloned()
            .ok_or(GatewayError::NoStrategy)
    }

    /// Evaluate every enabled, non-expired rule against this analysis. The
    /// last fired set is kept in `rule_cache` purely for diagnostics; a
    /// 1-minute sweep (`sweep_rule_cache`) drops it once stale (§5).
    fn fired_rules(&self, analysis: &RequestAnalysisResult) -> Vec<(String, f64)> {
        let rules = self.rules.lock().expect("rules mutex poisoned");
        let now = Utc::now();
        let fired: Vec<(String, f64)> = rules
            .values()
            .filter(|r| r.fires(analysis, now))
            .map(|r| (r.name.clone(), r.weight))
            .collect();
        *self.rule_cache.lock().expect("rule cache mutex poisoned") = Some(RuleCacheEntry {
            fired: fired.clone(),
            cached_at: Instant::now(),
        });
        fired
    }

    /// Drops the diagnostic rule cache once older than [`RULE_CACHE_TTL`].
    /// Intended to be driven by the scheduler's periodic timer alongside
    /// the health-check loop.
    pub fn sweep_rule_cache(&self) {
        let mut cache = self.rule_cache.lock().expect("rule cache mutex poisoned");
        if cache.as_ref().is_some_and(|e| e.cached_at.elapsed() >= RULE_CACHE_TTL) {
            *cache = None;
        }
    }

    /// The rule names that fired on the most recent `decide` call, if the
    /// cache hasn't been swept yet.
    pub fn last_fired_rules(&self) -> Vec<String> {
        self.rule_cache
            .lock()
            .expect("rule cache mutex poisoned")
            .as_ref()
            .map(|e| e.fired.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    fn rule_bonus(fired: &[(String, f64)]) -> f64 {
        let raw: f64 = fired.iter().map(|(_, w)| w * RULE_BONUS_PER_WEIGHT).sum();
        raw.min(RULE_BONUS_CAP)
    }

    /// `scorePool(analysis, poolId) -> RoutingMatchResult` (§4.6 pool
    /// scoring). Hard checks gate `is_match`; soft scores combine per
    /// strategy weights plus the rule bonus, clamped to `[0,1]`.
    pub fn score_pool(
        &self,
        analysis: &RequestAnalysisResult,
        pool_id: &str,
        caps: &RoutingCapabilities,
        strategy: &RoutingStrategy,
        rule_bonus: f64,
    ) -> RoutingMatchResult {
        let model_support = !caps.supported_models.is_empty();
        let streaming_support = !analysis.requires_streaming || caps.streaming;
        let tools_support = !analysis.has_tool_calls || caps.tools;
        let images_support = !analysis.has_images || caps.images;
        let multimodal_support = !analysis.special_requirements.needs_multimodal || caps.multimodal;
        let modality_support = analysis.modalities.is_subset(&caps.supported_modalities);
        let availability_ok = caps.availability > 0.1;

        let is_match = model_support
            && streaming_support
            && tools_support
            && images_support
            && multimodal_support
            && modality_support
            && availability_ok;

        let token_score = if caps.max_tokens == 0 { 0.0 } else { 1.0 };
        let modality_coverage = if caps.supported_modalities.is_empty() {
            0.0
        } else {
            analysis
                .modalities
                .intersection(&caps.supported_modalities)
                .count() as f64
                / analysis.modalities.len().max(1) as f64
        };
        let function_match = {
            let mut required = 0u32;
            let mut satisfied = 0u32;
            if analysis.has_tool_calls {
                required += 1;
                satisfied += caps.tools as u32;
            }
            if analysis.has_function_calls {
                required += 1;
                satisfied += caps.function_calling as u32;
            }
            if required == 0 {
                1.0
            } else {
                satisfied as f64 / required as f64
            }
        };
        let capability_score = 0.3 * token_score
            + 0.25 * modality_coverage
            + 0.25 * function_match
            + 0.2 * analysis.complexity_score.min(caps.priority as f64 / 100.0);

        let performance_score = caps.performance_score;
        let cost_score = 1.0 - caps.cost_score;
        let availability_score = caps.availability;
        let priority_score = caps.priority as f64 / 100.0;

        let weighted = strategy.weights.capability * capability_score
            + strategy.weights.performance * performance_score
            + strategy.weights.cost * cost_score
            + strategy.weights.availability * availability_score
            + strategy.weights.priority * priority_score;

        let match_score = (weighted + rule_bonus).clamp(0.0, 1.0);

        RoutingMatchResult {
            pool_id: pool_id.to_string(),
            match_score,
            is_match,
            rule_bonus,
        }
    }

    /// `decide(analysis, context?, strategyName?) -> RoutingDecision`.
    #[instrument(skip(self, analysis))]
    pub fn decide(
        &self,
        analysis: &RequestAnalysisResult,
        strategy_name: Option<&str>,
    ) -> Result<RoutingDecision, GatewayError> {
        let start = Instant::now();
        let strategy = self.resolve_strategy(strategy_name)?;
        let fired = self.fired_rules(analysis);
        let rule_bonus = Self::rule_bonus(&fired);

        let pools: HashMap<String, RoutingCapabilities> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut scored: Vec<RoutingMatchResult> = pools
            .iter()
            .map(|(id, caps)| self.score_pool(analysis, id, caps, &strategy, rule_bonus))
            .collect();

        let mut candidates: Vec<RoutingMatchResult> = scored
            .iter()
            .filter(|m| m.is_match && m.match_score >= strategy.thresholds.minimum_match)
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let pa = pools.get(&a.pool_id).map(|c| c.priority).unwrap_or(0);
                    let pb = pools.get(&b.pool_id).map(|c| c.priority).unwrap_or(0);
                    pb.cmp(&pa)
                })
                .then_with(|| a.pool_id.cmp(&b.pool_id))
        });

        let (chosen, alternatives, fallback_used) = if candidates.is_empty() {
            if self.enable_fallback {
                let fallback = self.make_fallback(&pools)?;
                (fallback, Vec::new(), true)
            } else {
                return Err(GatewayError::NoCandidates);
            }
        } else {
            let load_balanced = self.maybe_load_balance(&candidates, &strategy, &pools);
            let chosen = load_balanced.unwrap_or_else(|| candidates[0].clone());
            let alternatives: Vec<RoutingMatchResult> = candidates
                .iter()
                .filter(|c| c.pool_id != chosen.pool_id)
                .take(self.max_alternatives)
                .cloned()
                .collect();
            (chosen, alternatives, false)
        };

        self.update_stats(&chosen, start.elapsed(), fallback_used);

        // keep `scored` alive for potential future inspection/logging
        scored.clear();

        Ok(RoutingDecision {
            target_routing_id: chosen.pool_id.clone(),
            selected_pool_id: chosen.pool_id.clone(),
            match_result: chosen,
            alternatives,
            metadata: DecisionMetadata {
                routing_time: start.elapsed(),
                strategy_used: strategy.name.clone(),
                decision_reason: if fallback_used {
                    "fallback: no candidate met minimum match threshold".to_string()
                } else {
                    "scored candidate selection".to_string()
                },
                fallback_used,
            },
        })
    }

    fn make_fallback(
        &self,
        pools: &HashMap<String, RoutingCapabilities>,
    ) -> Result<RoutingMatchResult, GatewayError> {
        pools
            .iter()
            .max_by(|a, b| {
                a.1.availability
                    .partial_cmp(&b.1.availability)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, caps)| RoutingMatchResult {
                pool_id: id.clone(),
                match_score: caps.availability,
                is_match: true,
                rule_bonus: 0.0,
            })
            .ok_or(GatewayError::NoCandidates)
    }

    /// If load balancing is enabled and at least two candidates clear the
    /// load-balance threshold, reselect among them via the strategy's
    /// algorithm (§4.6 step 6).
    fn maybe_load_balance(
        &self,
        candidates: &[RoutingMatchResult],
        strategy: &RoutingStrategy,
        pools: &HashMap<String, RoutingCapabilities>,
    ) -> Option<RoutingMatchResult> {
        if !strategy.load_balancing.enabled {
            return None;
        }
        let eligible: Vec<&RoutingMatchResult> = candidates
            .iter()
            .filter(|c| c.match_score >= strategy.thresholds.load_balance)
            .collect();
        if eligible.len() < 2 {
            return None;
        }

        let stats = self.stats.lock().expect("stats mutex poisoned");
        let selected = match strategy.load_balancing.algorithm {
            LoadBalancingAlgorithm::RoundRobin => {
                let idx = stats.total_decisions as usize % eligible.len();
                eligible[idx]
            }
            LoadBalancingAlgorithm::Weighted => {
                let weight_of = |c: &RoutingMatchResult| {
                    pools.get(&c.pool_id).map(|caps| caps.load_weight.max(0.0)).unwrap_or(0.0)
                };
                let total: f64 = eligible.iter().map(|c| weight_of(c)).sum();
                if total <= 0.0 {
                    eligible[0]
                } else {
                    let mut draw = rand::thread_rng().gen_range(0.0..total);
                    let mut selected = eligible[0];
                    for c in &eligible {
                        let w = weight_of(c);
                        if draw < w {
                            selected = c;
                            break;
                        }
                        draw -= w;
                    }
                    selected
                }
            }
            LoadBalancingAlgorithm::LeastConnections => eligible
                .iter()
                .min_by_key(|c| stats.routing_usage.get(&c.pool_id).copied().unwrap_or(0))
                .copied()
                .unwrap_or(eligible[0]),
            LoadBalancingAlgorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..eligible.len());
                eligible[idx]
            }
        };
        drop(stats);
        self.stats.lock().expect("stats mutex poisoned").load_balanced_decisions += 1;
        Some(selected.clone())
    }

    fn update_stats(&self, chosen: &RoutingMatchResult, elapsed: Duration, fallback_used: bool) {
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        let n = stats.total_decisions + 1;
        stats.total_decisions = n;
        if fallback_used {
            stats.fallback_decisions += 1;
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        stats.avg_decision_time_ms = ((n - 1) as f64 * stats.avg_decision_time_ms + elapsed_ms) / n as f64;
        stats.avg_match_score =
            ((n - 1) as f64 * stats.avg_match_score + chosen.match_score) / n as f64;
        *stats.routing_usage.entry(chosen.pool_id.clone()).or_insert(0) += 1;
        self.decision_counter.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %chosen.pool_id, score = chosen.match_score, fallback_used, "routing decision recorded");
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, RequestType};
    use std::collections::HashSet;

    fn analysis_chat() -> RequestAnalysisResult {
        RequestAnalysisResult {
            token_count: 5,
            has_tool_calls: false,
            has_images: false,
            has_function_calls: false,
            modalities: HashSet::from(["text".to_string()]),
            request_type: RequestType::Chat,
            complexity_score: 0.1,
            priority: Priority::Low,
            requires_streaming: false,
            special_requirements: Default::default(),
            user_context: None,
        }
    }

    fn caps(streaming: bool, tools: bool, images: bool, priority: u32) -> RoutingCapabilities {
        let mut c = RoutingCapabilities::inferred_default("generic-model");
        c.streaming = streaming;
        c.tools = tools;
        c.images = images;
        c.priority = priority;
        c
    }

    #[test]
    fn chat_with_no_specials_prefers_higher_priority_capable_pool() {
        let engine = RoutingRulesEngine::new(true, 3);
        engine.register_pool("a", caps(true, false, false, 60));
        engine.register_pool("b", caps(true, true, true, 80));

        let decision = engine.decide(&analysis_chat(), Some("balanced")).unwrap();
        assert_eq!(decision.selected_pool_id, "b");
        assert!(decision.match_result.match_score > 0.3);
    }

    #[test]
    fn vision_required_falls_back_when_only_capable_pool_removed() {
        let engine = RoutingRulesEngine::new(true, 3);
        engine.register_pool("a", caps(true, false, false, 60));

        let mut analysis = analysis_chat();
        analysis.has_images = true;
        analysis.modalities.insert("vision".to_string());

        let decision = engine.decide(&analysis, Some("balanced")).unwrap();
        assert!(decision.metadata.fallback_used);
    }

    #[test]
    fn no_candidates_without_fallback_raises() {
        let engine = RoutingRulesEngine::new(false, 3);
        engine.register_pool("a", caps(false, false, false, 10));

        let mut analysis = analysis_chat();
        analysis.requires_streaming = true;

        let err = engine.decide(&analysis, Some("balanced")).unwrap_err();
        assert!(matches!(err, GatewayError::NoCandidates));
    }

    #[test]
    fn score_is_always_within_unit_interval() {
        let engine = RoutingRulesEngine::new(true, 3);
        let strategy = default_strategies().remove(0);
        let c = caps(true, true, true, 100);
        let result = engine.score_pool(&analysis_chat(), "x", &c, &strategy, 0.2);
        assert!(result.match_score >= 0.0 && result.match_score <= 1.0);
    }

    #[test]
    fn missing_strategy_name_falls_back_to_default() {
        let engine = RoutingRulesEngine::new(true, 3);
        engine.register_pool("a", caps(true, true, true, 80));
        let decision = engine.decide(&analysis_chat(), Some("does-not-exist")).unwrap();
        assert_eq!(decision.metadata.strategy_used, "balanced");
    }

    #[test]
    fn deregistered_pool_is_no_longer_a_candidate() {
        let engine = RoutingRulesEngine::new(true, 1);
        engine.register_pool("a", caps(true, true, true, 80));
        engine.deregister_pool("a");
        assert_eq!(engine.pool_count(), 0);
    }

    #[test]
    fn weighted_load_balancing_never_picks_a_zero_weight_candidate() {
        let engine = RoutingRulesEngine::new(true, 3);
        let mut zero_weight = caps(true, true, true, 80);
        zero_weight.load_weight = 0.0;
        let heavy = caps(true, true, true, 80);

        let mut pools = HashMap::new();
        pools.insert("a".to_string(), zero_weight);
        pools.insert("b".to_string(), heavy);

        let mut strategy = default_strategies().remove(0);
        strategy.load_balancing.algorithm = LoadBalancingAlgorithm::Weighted;
        strategy.thresholds.load_balance = 0.0;

        let candidates = vec![
            RoutingMatchResult { pool_id: "a".into(), match_score: 0.9, is_match: true, rule_bonus: 0.0 },
            RoutingMatchResult { pool_id: "b".into(), match_score: 0.9, is_match: true, rule_bonus: 0.0 },
        ];

        for _ in 0..20 {
            let selected = engine
                .maybe_load_balance(&candidates, &strategy, &pools)
                .expect("two eligible candidates above threshold");
            assert_eq!(selected.pool_id, "b");
        }
    }
}
