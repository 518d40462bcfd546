//! LLM Provider Abstraction
//!
//! Completion backends implement [`Provider`]. Every backend offers a blocking call and a
//! streamed call with the same semantics; the streamed call reports zero or more content
//! chunks followed by exactly one terminal callback.

pub mod anthropic;
pub mod openai;
pub mod registry;
mod sse;
pub mod stub;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;
pub use stub::StubProvider;

use async_trait::async_trait;
use flowlang::{RuntimeError, RuntimeResult, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Calls requested by the assistant in this message
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// For `Role::Tool`: the call this message answers
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// A tool offered to the model, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolDefinition>,
    pub stop: Vec<String>,
}

impl CompletionRequest {
    /// Content of the most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Other(String),
}

/// Input/output/total count of tokens consumed by one or more model calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }

    pub fn to_value(&self) -> Value {
        Value::object([
            ("input", Value::Number(self.input_tokens as f64)),
            ("output", Value::Number(self.output_tokens as f64)),
            ("total", Value::Number(self.total_tokens as f64)),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub model: String,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
            model: String::new(),
        }
    }

    pub fn wants_tools(&self) -> bool {
        self.finish_reason == FinishReason::ToolUse && !self.tool_calls.is_empty()
    }
}

/// Receiver for incremental completion output.
pub trait StreamHandler: Send + Sync {
    fn on_chunk(&self, chunk: &str);
    fn on_complete(&self, response: &CompletionResponse);
    fn on_error(&self, error: &RuntimeError);
}

/// Abstract interface for completion backends
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Single blocking completion
    async fn complete(&self, request: &CompletionRequest) -> RuntimeResult<CompletionResponse>;

    /// Same as `complete`, reporting content deltas to `handler` as they arrive
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        handler: &dyn StreamHandler,
    ) -> RuntimeResult<CompletionResponse>;

    async fn list_models(&self) -> RuntimeResult<Vec<String>>;
}

/// Calls the handler's terminal callback for a finished stream.
pub(crate) fn finish_stream(
    handler: &dyn StreamHandler,
    result: RuntimeResult<CompletionResponse>,
) -> RuntimeResult<CompletionResponse> {
    match &result {
        Ok(response) => handler.on_complete(response),
        Err(e) => handler.on_error(e),
    }
    result
}

/// Parse a tool-call argument string, keeping unparseable payloads visible to the tool.
pub(crate) fn parse_tool_arguments(raw: &str) -> JsonValue {
    if raw.trim().is_empty() {
        return JsonValue::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "raw_arguments": raw }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage::new(10, 5));
        total.add(&TokenUsage::new(1, 2));
        assert_eq!(total, TokenUsage::new(11, 7));
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn wants_tools_requires_both_reason_and_calls() {
        let mut response = CompletionResponse::text("");
        response.finish_reason = FinishReason::ToolUse;
        assert!(!response.wants_tools());
        response.tool_calls.push(ToolCall {
            id: "1".into(),
            name: "t".into(),
            arguments: serde_json::json!({}),
        });
        assert!(response.wants_tools());
        response.finish_reason = FinishReason::Stop;
        assert!(!response.wants_tools());
    }

    #[test]
    fn malformed_arguments_are_preserved() {
        assert_eq!(parse_tool_arguments("{\"a\":1}")["a"], 1);
        assert_eq!(parse_tool_arguments("not json")["raw_arguments"], "not json");
        assert!(parse_tool_arguments("").as_object().unwrap().is_empty());
    }
}
