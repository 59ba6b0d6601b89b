//! Named weighting/thresholding profiles controlling how candidate scores
//! combine and how load is balanced.

use serde::{Deserialize, Serialize};

use crate::pipeline::LoadBalancingAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingAlgorithm {
    Exact,
    ScoreBased,
    Weighted,
    PriorityBased,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub capability: f64,
    pub performance: f64,
    pub cost: f64,
    pub availability: f64,
    pub priority: f64,
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.capability + self.performance + self.cost + self.availability + self.priority
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub minimum_match: f64,
    pub high_availability: f64,
    pub load_balance: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    pub enabled: bool,
    pub algorithm: LoadBalancingAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStrategy {
    pub name: String,
    pub is_default: bool,
    pub enabled: bool,
    pub matching_algorithm: MatchingAlgorithm,
    pub weights: ScoreWeights,
    pub thresholds: Thresholds,
    pub load_balancing: LoadBalancingConfig,
}

impl RoutingStrategy {
    pub fn validate(&self) -> Result<(), String> {
        if self.weights.sum() > 1.0 + 1e-9 {
            return Err(format!(
                "strategy '{}' weights must sum to <= 1, got {}",
                self.name,
                self.weights.sum()
            ));
        }
        Ok(())
    }
}

/// The three baseline strategies installed at engine construction (§4.6).
pub fn default_strategies() -> Vec<RoutingStrategy> {
    vec![
        RoutingStrategy {
            name: "balanced".into(),
            is_default: true,
            enabled: true,
            matching_algorithm: MatchingAlgorithm::ScoreBased,
            weights: ScoreWeights {
                capability: 0.3,
                performance: 0.2,
                cost: 0.15,
                availability: 0.2,
                priority: 0.15,
            },
            thresholds: Thresholds {
                minimum_match: 0.3,
                high_availability: 0.8,
                load_balance: 0.6,
            },
            load_balancing: LoadBalancingConfig {
                enabled: true,
                algorithm: LoadBalancingAlgorithm::RoundRobin,
            },
        },
        RoutingStrategy {
            name: "performance".into(),
            is_default: false,
            enabled: true,
            matching_algorithm: MatchingAlgorithm::ScoreBased,
            weights: ScoreWeights {
                capability: 0.2,
                performance: 0.45,
                cost: 0.05,
                availability: 0.2,
                priority: 0.1,
            },
            thresholds: Thresholds {
                minimum_match: 0.3,
                high_availability: 0.8,
                load_balance: 0.6,
            },
            load_balancing: LoadBalancingConfig {
                enabled: true,
                algorithm: LoadBalancingAlgorithm::LeastConnections,
            },
        },
        RoutingStrategy {
            name: "cost".into(),
            is_default: false,
            enabled: true,
            matching_algorithm: MatchingAlgorithm::ScoreBased,
            weights: ScoreWeights {
                capability: 0.2,
                performance: 0.1,
                cost: 0.45,
                availability: 0.15,
                priority: 0.1,
            },
            thresholds: Thresholds {
                minimum_match: 0.3,
                high_availability: 0.8,
                load_balance: 0.6,
            },
            load_balancing: LoadBalancingConfig {
                enabled: true,
                algorithm: LoadBalancingAlgorithm::Weighted,
            },
        },
    ]
}
