//! Anthropic Messages API provider.

use super::sse::{for_each_event, SseControl};
use super::{
    finish_stream, parse_tool_arguments, CompletionRequest, CompletionResponse, FinishReason,
    Message, Provider, Role, StreamHandler, TokenUsage, ToolCall,
};
use crate::config::HttpProviderConfig;
use async_trait::async_trait;
use flowlang::{RuntimeError, RuntimeResult};
use futures::Stream;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt::Display;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(settings: &HttpProviderConfig) -> RuntimeResult<Self> {
        let api_key = settings.resolve_api_key("ANTHROPIC_API_KEY").ok_or_else(|| {
            RuntimeError::ProviderUnavailable("API key required for Anthropic provider".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| {
                RuntimeError::RequestFailed(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        })
    }

    async fn post(&self, body: &JsonValue) -> RuntimeResult<reqwest::Response> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RuntimeError::RequestFailed(format!(
                "Anthropic API request failed ({}): {}",
                status.as_u16(),
                text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> RuntimeResult<CompletionResponse> {
        let body = build_request_body(request, false);
        debug!(model = %request.model, "anthropic messages call");
        let json: JsonValue = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("Failed to parse response: {}", e)))?;
        parse_response(&json)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        handler: &dyn StreamHandler,
    ) -> RuntimeResult<CompletionResponse> {
        let body = build_request_body(request, true);
        debug!(model = %request.model, "anthropic streaming messages call");
        let result = match self.post(&body).await {
            Ok(response) => consume_stream(response.bytes_stream(), handler, &request.model).await,
            Err(e) => Err(e),
        };
        finish_stream(handler, result)
    }

    async fn list_models(&self) -> RuntimeResult<Vec<String>> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let json: JsonValue = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("HTTP request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("Failed to parse models: {}", e)))?;
        Ok(json["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn tool_result_block(message: &Message) -> JsonValue {
    json!({
        "type": "tool_result",
        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
        "content": message.content,
    })
}

/// System prompts are a top-level field; tool results travel as user content blocks,
/// with consecutive results folded into one message.
pub(crate) fn build_request_body(request: &CompletionRequest, stream: bool) -> JsonValue {
    let mut system_parts: Vec<String> = request.system.iter().cloned().collect();
    let mut messages: Vec<JsonValue> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => system_parts.push(message.content.clone()),
            Role::User => messages.push(json!({ "role": "user", "content": message.content })),
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    messages.push(json!({ "role": "assistant", "content": message.content }));
                    continue;
                }
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": message.content }));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let block = tool_result_block(message);
                let follows_results = messages.last().map_or(false, |last| {
                    last["role"] == "user"
                        && last["content"].as_array().map_or(false, |content| {
                            content.iter().all(|b| b["type"] == "tool_result")
                        })
                });
                match messages
                    .last_mut()
                    .filter(|_| follows_results)
                    .and_then(|last| last["content"].as_array_mut())
                {
                    Some(content) => content.push(block),
                    None => messages.push(json!({ "role": "user", "content": [block] })),
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if !request.tools.is_empty() {
        body["tools"] = JsonValue::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    if !request.stop.is_empty() {
        body["stop_sequences"] = json!(request.stop);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn stop_reason(raw: &str) -> FinishReason {
    match raw {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolUse,
        "max_tokens" => FinishReason::Length,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn parse_response(json: &JsonValue) -> RuntimeResult<CompletionResponse> {
    let blocks = json["content"].as_array().ok_or_else(|| {
        RuntimeError::RequestFailed("Anthropic response missing content".to_string())
    })?;
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }
    Ok(CompletionResponse {
        content,
        tool_calls,
        finish_reason: stop_reason(json["stop_reason"].as_str().unwrap_or("end_turn")),
        usage: TokenUsage::new(
            json["usage"]["input_tokens"].as_u64().unwrap_or(0),
            json["usage"]["output_tokens"].as_u64().unwrap_or(0),
        ),
        model: json["model"].as_str().unwrap_or_default().to_string(),
    })
}

enum Block {
    Text,
    ToolUse {
        id: String,
        name: String,
        input: String,
    },
}

pub(crate) async fn consume_stream<S, B, E>(
    body: S,
    handler: &dyn StreamHandler,
    model: &str,
) -> RuntimeResult<CompletionResponse>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let mut content = String::new();
    let mut blocks: BTreeMap<u64, Block> = BTreeMap::new();
    let mut reason = FinishReason::Stop;
    let mut input_tokens = 0;
    let mut output_tokens = 0;
    let mut model_name = model.to_string();

    for_each_event(body, |_, data| {
        if data.trim().is_empty() {
            return Ok(SseControl::Continue);
        }
        let event: JsonValue = serde_json::from_str(data)?;
        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let message = &event["message"];
                if let Some(m) = message["model"].as_str() {
                    model_name = m.to_string();
                }
                input_tokens = message["usage"]["input_tokens"].as_u64().unwrap_or(0);
            }
            "content_block_start" => {
                let index = event["index"].as_u64().unwrap_or(0);
                let block = &event["content_block"];
                let entry = if block["type"] == "tool_use" {
                    Block::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input: String::new(),
                    }
                } else {
                    Block::Text
                };
                blocks.insert(index, entry);
            }
            "content_block_delta" => {
                let index = event["index"].as_u64().unwrap_or(0);
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if !text.is_empty() {
                            handler.on_chunk(text);
                            content.push_str(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(Block::ToolUse { input, .. }) = blocks.get_mut(&index) {
                            input.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(raw) = event["delta"]["stop_reason"].as_str() {
                    reason = stop_reason(raw);
                }
                if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                    output_tokens = out;
                }
            }
            "message_stop" => return Ok(SseControl::Stop),
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                return Err(RuntimeError::RequestFailed(format!(
                    "Anthropic stream error: {}",
                    message
                )));
            }
            _ => {}
        }
        Ok(SseControl::Continue)
    })
    .await?;

    let tool_calls = blocks
        .into_values()
        .filter_map(|block| match block {
            Block::ToolUse { id, name, input } => Some(ToolCall {
                id,
                name,
                arguments: parse_tool_arguments(&input),
            }),
            Block::Text => None,
        })
        .collect();

    Ok(CompletionResponse {
        content,
        tool_calls,
        finish_reason: reason,
        usage: TokenUsage::new(input_tokens, output_tokens),
        model: model_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        chunks: Mutex<Vec<String>>,
    }

    impl StreamHandler for Collect {
        fn on_chunk(&self, chunk: &str) {
            self.chunks.lock().unwrap().push(chunk.to_string());
        }
        fn on_complete(&self, _response: &CompletionResponse) {}
        fn on_error(&self, _error: &RuntimeError) {}
    }

    fn sse(events: &[&str]) -> impl Stream<Item = Result<String, std::io::Error>> + Send {
        let owned: Vec<_> = events
            .iter()
            .map(|data| Ok(format!("data: {}\n\n", data)))
            .collect();
        futures::stream::iter(owned)
    }

    #[test]
    fn tool_results_fold_into_one_user_message() {
        let request = CompletionRequest {
            model: "claude-3-5-sonnet".into(),
            system: Some("sys".into()),
            messages: vec![
                Message::user("go"),
                Message::assistant_with_tools(
                    "thinking",
                    vec![
                        ToolCall {
                            id: "a".into(),
                            name: "one".into(),
                            arguments: json!({}),
                        },
                        ToolCall {
                            id: "b".into(),
                            name: "two".into(),
                            arguments: json!({"x": 1}),
                        },
                    ],
                ),
                Message::tool_result("a", "one", "r1"),
                Message::tool_result("b", "two", "r2"),
            ],
            ..Default::default()
        };
        let body = build_request_body(&request, false);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], 1024);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[2]["content"][1]["tool_use_id"], "b");
    }

    #[test]
    fn parses_mixed_content_blocks() {
        let response = parse_response(&json!({
            "model": "claude-3-5-sonnet",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "t1", "name": "weather", "input": {"city": "Rome"}}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 8}
        }))
        .unwrap();
        assert_eq!(response.content, "Let me check.");
        assert!(response.wants_tools());
        assert_eq!(response.tool_calls[0].arguments["city"], "Rome");
        assert_eq!(response.usage.total_tokens, 28);
    }

    #[tokio::test]
    async fn stream_stops_at_message_stop() {
        let body = sse(&[
            r#"{"type":"message_start","message":{"model":"claude-x","usage":{"input_tokens":7}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
            r#"{"type":"message_stop"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"late"}}"#,
        ]);
        let handler = Collect::default();
        let response = consume_stream(body, &handler, "claude").await.unwrap();
        assert_eq!(response.content, "Hi there");
        assert_eq!(response.model, "claude-x");
        assert_eq!(response.usage, TokenUsage::new(7, 3));
        assert_eq!(handler.chunks.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stream_collects_tool_input_fragments() {
        let body = sse(&[
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t9","name":"search"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let handler = Collect::default();
        let response = consume_stream(body, &handler, "claude").await.unwrap();
        assert!(response.wants_tools());
        assert_eq!(response.tool_calls[0].name, "search");
        assert_eq!(response.tool_calls[0].arguments["q"], "rust");
    }

    #[tokio::test]
    async fn error_event_fails_the_stream() {
        let body = sse(&[r#"{"type":"error","error":{"message":"overloaded"}}"#]);
        let handler = Collect::default();
        let err = consume_stream(body, &handler, "claude").await.unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }
}
