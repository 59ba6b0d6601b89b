//! Declarative routing rules and their condition evaluation.
//!
//! Grounded on a condition/operator evaluator over dot-path field
//! resolution, generalized from policy enforcement to routing-rule bonuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::{resolve_dot_path, RequestAnalysisResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn evaluate(&self, analysis: &RequestAnalysisResult) -> bool {
        let analysis_value = match serde_json::to_value(analysis) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let Some(field_value) = resolve_dot_path(&analysis_value, &self.field) else {
            return false;
        };
        evaluate_operator(&field_value, self.operator, &self.value)
    }
}

fn evaluate_operator(field: &Value, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Equals => field == expected,
        Operator::Contains => match (field, expected) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), _) => items.contains(expected),
            _ => false,
        },
        Operator::GreaterThan => compare_numbers(field, expected).map(|o| o.is_gt()).unwrap_or(false),
        Operator::LessThan => compare_numbers(field, expected).map(|o| o.is_lt()).unwrap_or(false),
        Operator::In => match expected {
            Value::Array(items) => items.contains(field),
            _ => false,
        },
        Operator::NotIn => match expected {
            Value::Array(items) => !items.contains(field),
            _ => true,
        },
        Operator::Regex => match (field, expected) {
            (Value::String(s), Value::String(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    pub weight: f64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoutingRule {
    /// A rule fires iff every condition holds (§3) and it is enabled and
    /// unexpired.
    pub fn fires(&self, analysis: &RequestAnalysisResult, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.evaluate(analysis))
    }
}

/// The five baseline rules installed at engine construction (§4.6), written
/// in terms of the analyser's own field names so they evaluate via the same
/// dot-path resolver as user-supplied rules.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            name: "high_complexity_critical".into(),
            enabled: true,
            priority: 90,
            conditions: vec![Condition {
                field: "priority".into(),
                operator: Operator::Equals,
                value: Value::String("critical".into()),
            }],
            actions: vec![],
            weight: 1.0,
            expires_at: None,
        },
        RoutingRule {
            name: "vision_request".into(),
            enabled: true,
            priority: 80,
            conditions: vec![Condition {
                field: "has_images".into(),
                operator: Operator::Equals,
                value: Value::Bool(true),
            }],
            actions: vec![],
            weight: 0.8,
            expires_at: None,
        },
        RoutingRule {
            name: "streaming_request".into(),
            enabled: true,
            priority: 60,
            conditions: vec![Condition {
                field: "requires_streaming".into(),
                operator: Operator::Equals,
                value: Value::Bool(true),
            }],
            actions: vec![],
            weight: 0.5,
            expires_at: None,
        },
        RoutingRule {
            name: "tool_calling_request".into(),
            enabled: true,
            priority: 70,
            conditions: vec![Condition {
                field: "has_tool_calls".into(),
                operator: Operator::Equals,
                value: Value::Bool(true),
            }],
            actions: vec![],
            weight: 0.6,
            expires_at: None,
        },
        RoutingRule {
            name: "large_token_request".into(),
            enabled: true,
            priority: 50,
            conditions: vec![Condition {
                field: "token_count".into(),
                operator: Operator::GreaterThan,
                value: Value::Number(serde_json::Number::from(100_000)),
            }],
            actions: vec![],
            weight: 0.4,
            expires_at: None,
        },
    ]
}
