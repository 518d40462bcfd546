//! OpenAI-compatible chat completions provider (OpenAI, OpenRouter, local gateways).

use super::sse::{for_each_event, SseControl};
use super::{
    finish_stream, parse_tool_arguments, CompletionRequest, CompletionResponse, FinishReason,
    Provider, Role, StreamHandler, TokenUsage, ToolCall,
};
use crate::config::HttpProviderConfig;
use async_trait::async_trait;
use flowlang::{RuntimeError, RuntimeResult};
use futures::Stream;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt::Display;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(settings: &HttpProviderConfig) -> RuntimeResult<Self> {
        let api_key = settings.resolve_api_key("OPENAI_API_KEY").ok_or_else(|| {
            RuntimeError::ProviderUnavailable("API key required for OpenAI provider".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| {
                RuntimeError::RequestFailed(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            name: "openai".to_string(),
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        })
    }

    /// Register under a different name, e.g. for an OpenRouter or local endpoint.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn post(&self, body: &JsonValue) -> RuntimeResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RuntimeError::RequestFailed(format!(
                "API request failed ({}): {}",
                status.as_u16(),
                text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> RuntimeResult<CompletionResponse> {
        let body = build_request_body(request, false);
        debug!(provider = %self.name, model = %request.model, "chat completion");
        let response = self.post(&body).await?;
        let raw = response
            .text()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("Failed to read body: {}", e)))?;
        let json: JsonValue = serde_json::from_str(&raw)?;
        parse_response(&json)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        handler: &dyn StreamHandler,
    ) -> RuntimeResult<CompletionResponse> {
        let body = build_request_body(request, true);
        debug!(provider = %self.name, model = %request.model, "streaming chat completion");
        let result = match self.post(&body).await {
            Ok(response) => consume_stream(response.bytes_stream(), handler, &request.model).await,
            Err(e) => Err(e),
        };
        finish_stream(handler, result)
    }

    async fn list_models(&self) -> RuntimeResult<Vec<String>> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RuntimeError::RequestFailed(format!("HTTP request failed: {}", e)))?;
        let json: JsonValue = response
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

pub(crate) fn build_request_body(request: &CompletionRequest, stream: bool) -> JsonValue {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        let value = match message.role {
            Role::System => json!({ "role": "system", "content": message.content }),
            Role::User => json!({ "role": "user", "content": message.content }),
            Role::Assistant if !message.tool_calls.is_empty() => {
                let calls: Vec<JsonValue> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let content = if message.content.is_empty() {
                    JsonValue::Null
                } else {
                    JsonValue::String(message.content.clone())
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
            Role::Assistant => json!({ "role": "assistant", "content": message.content }),
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id,
                "content": message.content,
            }),
        };
        messages.push(value);
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.tools.is_empty() {
        body["tools"] = JsonValue::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if !request.stop.is_empty() {
        body["stop"] = json!(request.stop);
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "length" => FinishReason::Length,
        other => FinishReason::Other(other.to_string()),
    }
}

fn usage_from(json: &JsonValue) -> TokenUsage {
    let input = json["prompt_tokens"].as_u64().unwrap_or(0);
    let output = json["completion_tokens"].as_u64().unwrap_or(0);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: json["total_tokens"].as_u64().unwrap_or(input + output),
    }
}

pub(crate) fn parse_response(json: &JsonValue) -> RuntimeResult<CompletionResponse> {
    let choice = json["choices"]
        .get(0)
        .ok_or_else(|| RuntimeError::RequestFailed("LLM response missing choices".to_string()))?;
    let message = &choice["message"];
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, item)| {
                    let name = item["function"]["name"].as_str()?.to_string();
                    let id = item["id"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("tool_call_{}", idx + 1));
                    let arguments =
                        parse_tool_arguments(item["function"]["arguments"].as_str().unwrap_or("{}"));
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        finish_reason: finish_reason(choice["finish_reason"].as_str().unwrap_or("stop")),
        usage: usage_from(&json["usage"]),
        model: json["model"].as_str().unwrap_or_default().to_string(),
    })
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassemble a streamed completion, forwarding content deltas to the handler.
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
    let mut calls: BTreeMap<u64, PartialToolCall> = BTreeMap::new();
    let mut reason = FinishReason::Stop;
    let mut usage = TokenUsage::default();
    let mut model_name = model.to_string();

    for_each_event(body, |_, data| {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(SseControl::Stop);
        }
        if data.is_empty() {
            return Ok(SseControl::Continue);
        }
        let chunk: JsonValue = serde_json::from_str(data)?;
        if let Some(m) = chunk["model"].as_str() {
            model_name = m.to_string();
        }
        if chunk["usage"].is_object() {
            usage = usage_from(&chunk["usage"]);
        }
        if let Some(choice) = chunk["choices"].get(0) {
            let delta = &choice["delta"];
            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty() {
                    handler.on_chunk(text);
                    content.push_str(text);
                }
            }
            if let Some(deltas) = delta["tool_calls"].as_array() {
                for call_delta in deltas {
                    let index = call_delta["index"].as_u64().unwrap_or(0);
                    let partial = calls.entry(index).or_default();
                    if let Some(id) = call_delta["id"].as_str() {
                        partial.id = id.to_string();
                    }
                    if let Some(name) = call_delta["function"]["name"].as_str() {
                        partial.name.push_str(name);
                    }
                    if let Some(args) = call_delta["function"]["arguments"].as_str() {
                        partial.arguments.push_str(args);
                    }
                }
            }
            if let Some(raw) = choice["finish_reason"].as_str() {
                reason = finish_reason(raw);
            }
        }
        Ok(SseControl::Continue)
    })
    .await?;

    let tool_calls = calls
        .into_iter()
        .map(|(index, partial)| ToolCall {
            id: if partial.id.is_empty() {
                format!("tool_call_{}", index + 1)
            } else {
                partial.id
            },
            name: partial.name,
            arguments: parse_tool_arguments(&partial.arguments),
        })
        .collect();

    Ok(CompletionResponse {
        content,
        tool_calls,
        finish_reason: reason,
        usage,
        model: model_name,
    })
}
