//! The core request/response projection and the analyser's output shape.
//!
//! `Request` is the small tagged sum defined at the core boundary (§9's
//! "weakly-typed any" re-architecture note) — the analyser consumes only
//! this projection, never a provider-specific wire format.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(alias = "image")]
    ImageUrl { image_url: Value },
    Audio { audio: Value },
    Video { video: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<Content>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The small tagged sum at the core boundary. Every provider-specific field
/// that doesn't fit lives in `extensions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub functions: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: RequestMetadata,
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub extensions: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Chat,
    Completion,
    Embedding,
    FunctionCall,
    ToolCall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecialRequirements {
    pub needs_multimodal: bool,
    pub needs_low_latency: bool,
    pub max_tokens_hint: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Produced by the analyser, consumed by the routing engine. Field values
/// are looked up by dot-path during rule evaluation — see [`crate::rules`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAnalysisResult {
    pub token_count: u64,
    pub has_tool_calls: bool,
    pub has_images: bool,
    pub has_function_calls: bool,
    pub modalities: HashSet<String>,
    pub request_type: RequestType,
    pub complexity_score: f64,
    pub priority: Priority,
    pub requires_streaming: bool,
    pub special_requirements: SpecialRequirements,
    pub user_context: Option<UserContext>,
}

impl RequestAnalysisResult {
    /// Dot-path field lookup used by rule condition evaluation, e.g.
    /// `"special_requirements.needs_multimodal"`.
    pub fn field(&self, path: &str) -> Option<Value> {
        let value = serde_json::to_value(self).ok()?;
        resolve_dot_path(&value, path)
    }
}

pub(crate) fn resolve_dot_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}
