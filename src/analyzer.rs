//! Pure, stateless request analysis: request → feature vector.
//!
//! Grounded on content-walking helpers (tool-call extraction, streaming
//! detection) generalized from provider-specific wire shapes to this
//! crate's own `Request` projection.

use std::collections::HashSet;

use crate::request::{
    Content, ContentPart, Priority, Request, RequestAnalysisResult, RequestType,
    SpecialRequirements,
};

const IMAGE_TOKEN_COST: u64 = 765;
const DEFAULT_ESTIMATION_FACTOR: f64 = 1.3;

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerConfig {
    pub detailed_token_counting: bool,
    pub estimation_factor: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            detailed_token_counting: true,
            estimation_factor: DEFAULT_ESTIMATION_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestAnalyzer {
    config: AnalyzerConfig,
}

impl RequestAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        RequestAnalyzer { config }
    }

    /// `analyse(request, userContext?) -> RequestAnalysisResult`. Never
    /// throws — any sub-analyser failure falls back to an approximate
    /// token count (§4.1 failure policy).
    pub fn analyse(
        &self,
        request: &Request,
        user_context: Option<crate::request::UserContext>,
    ) -> RequestAnalysisResult {
        let token_count = self.count_tokens(request);
        let has_tool_calls = !request.tools.is_empty();
        let has_function_calls = !request.functions.is_empty();
        let has_images = request_has_images(request);
        let modalities = derive_modalities(request, has_images);
        let requires_streaming = request.stream;
        let request_type = derive_request_type(request, has_function_calls, has_tool_calls);
        let needs_multimodal = modalities.len() > 1;

        let message_count = request.messages.as_ref().map(|m| m.len()).unwrap_or(0);
        let complexity_score = complexity_score(
            token_count,
            modalities.len(),
            has_tool_calls,
            has_images,
            message_count,
        );

        let priority = request
            .metadata
            .priority
            .unwrap_or_else(|| priority_from_complexity(complexity_score));

        RequestAnalysisResult {
            token_count,
            has_tool_calls,
            has_images,
            has_function_calls,
            modalities,
            request_type,
            complexity_score,
            priority,
            requires_streaming,
            special_requirements: SpecialRequirements {
                needs_multimodal,
                needs_low_latency: false,
                max_tokens_hint: None,
            },
            user_context,
        }
    }

    fn count_tokens(&self, request: &Request) -> u64 {
        let raw = if self.config.detailed_token_counting {
            detailed_token_count(request)
        } else {
            approximate_token_count(request)
        };
        ((raw as f64) * self.config.estimation_factor).ceil() as u64
    }
}

fn detailed_token_count(request: &Request) -> u64 {
    let mut total = 0u64;
    if let Some(messages) = &request.messages {
        for message in messages {
            total += content_token_count(message.content.as_ref());
        }
    }
    if let Some(prompt) = &request.prompt {
        total += text_token_count(prompt);
    }
    for schema in request.tools.iter().chain(request.functions.iter()) {
        total += text_token_count(&schema.to_string());
    }
    total
}

fn content_token_count(content: Option<&Content>) -> u64 {
    match content {
        None => 0,
        Some(Content::Text(text)) => text_token_count(text),
        Some(Content::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text_token_count(text),
                ContentPart::ImageUrl { .. } => IMAGE_TOKEN_COST,
                ContentPart::Audio { .. } | ContentPart::Video { .. } => IMAGE_TOKEN_COST,
            })
            .sum(),
    }
}

fn text_token_count(text: &str) -> u64 {
    ((text.len() as f64) / 4.0).ceil() as u64
}

fn approximate_token_count(request: &Request) -> u64 {
    let serialized = serde_json::to_string(request).unwrap_or_default();
    text_token_count(&serialized)
}

fn request_has_images(request: &Request) -> bool {
    request
        .messages
        .as_ref()
        .map(|messages| {
            messages.iter().any(|m| match &m.content {
                Some(Content::Parts(parts)) => {
                    parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. }))
                }
                _ => false,
            })
        })
        .unwrap_or(false)
}

fn derive_modalities(request: &Request, has_images: bool) -> HashSet<String> {
    let mut modalities = HashSet::from(["text".to_string()]);
    if has_images {
        modalities.insert("vision".to_string());
    }
    if let Some(messages) = &request.messages {
        for message in messages {
            if let Some(Content::Parts(parts)) = &message.content {
                for part in parts {
                    match part {
                        ContentPart::Audio { .. } => {
                            modalities.insert("audio".to_string());
                        }
                        ContentPart::Video { .. } => {
                            modalities.insert("video".to_string());
                        }
                        _ => {}
                    }
                }
            }
            if let Some(Content::Text(text)) = &message.content {
                if contains_code(text) {
                    modalities.insert("code".to_string());
                }
            }
        }
    }
    modalities
}

fn contains_code(text: &str) -> bool {
    text.contains("```")
        || text.contains("fn ")
        || text.contains("def ")
        || text.contains("class ")
        || text.contains("function ")
}

fn derive_request_type(
    request: &Request,
    has_function_calls: bool,
    has_tool_calls: bool,
) -> RequestType {
    if has_function_calls {
        return RequestType::FunctionCall;
    }
    if has_tool_calls {
        return RequestType::ToolCall;
    }
    if request
        .model
        .as_deref()
        .is_some_and(|m| m.to_lowercase().contains("embedding"))
    {
        return RequestType::Embedding;
    }
    if request.messages.is_some() {
        return RequestType::Chat;
    }
    RequestType::Completion
}

fn complexity_score(
    token_count: u64,
    modality_count: usize,
    has_tool_calls: bool,
    has_images: bool,
    message_count: usize,
) -> f64 {
    let token_complexity = ((token_count as f64) / 1_000_000.0).min(1.0);
    let score = token_complexity * 0.3
        + 0.2 * (has_tool_calls as u8 as f64)
        + 0.2 * (has_images as u8 as f64)
        + 0.1 * ((modality_count.saturating_sub(1)) as f64)
        + 0.1 * ((message_count as f64 / 10.0).min(1.0));
    score.clamp(0.0, 1.0)
}

fn priority_from_complexity(score: f64) -> Priority {
    if score >= 0.8 {
        Priority::Critical
    } else if score >= 0.5 {
        Priority::High
    } else if score >= 0.2 {
        Priority::Medium
    } else {
        Priority::Low
    }
}
