//! Scripted provider for tests and offline runs.
//!
//! Responses are served from a queue in the order they were pushed. Once the queue is
//! empty the provider echoes the last user message back.

use super::{
    finish_stream, CompletionRequest, CompletionResponse, FinishReason, Provider, StreamHandler,
    TokenUsage, ToolCall,
};
use async_trait::async_trait;
use flowlang::{RuntimeError, RuntimeResult};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct StubProvider {
    name: String,
    queue: Mutex<VecDeque<RuntimeResult<CompletionResponse>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::named("stub")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn push_response(&self, response: CompletionResponse) -> &Self {
        self.lock_queue().push_back(Ok(response));
        self
    }

    pub fn push_text(&self, content: impl Into<String>) -> &Self {
        let mut response = CompletionResponse::text(content);
        response.usage = TokenUsage::new(10, 5);
        self.push_response(response)
    }

    pub fn push_tool_call(&self, tool: impl Into<String>, arguments: JsonValue) -> &Self {
        let count = self.lock_queue().len();
        let response = CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{}", count + 1),
                name: tool.into(),
                arguments,
            }],
            finish_reason: FinishReason::ToolUse,
            usage: TokenUsage::new(10, 5),
            model: String::new(),
        };
        self.push_response(response)
    }

    pub fn push_error(&self, error: RuntimeError) -> &Self {
        self.lock_queue().push_back(Err(error));
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<RuntimeResult<CompletionResponse>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next(&self, request: &CompletionRequest) -> RuntimeResult<CompletionResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let scripted = self.lock_queue().pop_front();
        let mut response = match scripted {
            Some(result) => result?,
            None => CompletionResponse::text(request.last_user_message().unwrap_or_default()),
        };
        if response.model.is_empty() {
            response.model = request.model.clone();
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> RuntimeResult<CompletionResponse> {
        self.next(request)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        handler: &dyn StreamHandler,
    ) -> RuntimeResult<CompletionResponse> {
        let result = self.next(request);
        if let Ok(response) = &result {
            for chunk in response.content.split_inclusive(' ') {
                handler.on_chunk(chunk);
            }
        }
        finish_stream(handler, result)
    }

    async fn list_models(&self) -> RuntimeResult<Vec<String>> {
        Ok(vec!["stub-model".to_string()])
    }
}
