//! Per-execution state: variables, step outputs, token accounting and the deadline.
//!
//! The context is shared by reference across the awaits of one execution. Interior
//! state sits behind a synchronous mutex that is never held across an await point.

use crate::provider::TokenUsage;
use flowlang::{RuntimeError, RuntimeResult, Value};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Progress notifications delivered to a streaming caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Started { entity: String },
    StepStarted { step: String },
    StepCompleted { step: String, output: String },
    Chunk { content: String },
    ToolCall { tool: String, success: bool },
    Error { message: String },
    Finished { output: String },
}

pub type StreamSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub output: Value,
    pub usage: TokenUsage,
}

/// Outcome of one step, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub name: String,
    pub output: String,
    pub usage: TokenUsage,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Default, Clone)]
struct ContextState {
    variables: HashMap<String, Value>,
    step_records: HashMap<String, StepRecord>,
    results: Vec<StepResult>,
    usage: TokenUsage,
    turns: usize,
}

pub struct ExecutionContext {
    state: Mutex<ContextState>,
    deadline: Instant,
    stream: Option<StreamSink>,
    metadata: HashMap<String, String>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("state", &*self.lock())
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ContextState::default()),
            deadline: Instant::now() + timeout,
            stream: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_stream(mut self, sink: StreamSink) -> Self {
        self.stream = Some(sink);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Independent copy for a parallel branch. Shares the deadline and stream sink;
    /// starts with zeroed accounting so `merge` does not double count.
    pub fn fork(&self) -> Self {
        let state = self.lock();
        Self {
            state: Mutex::new(ContextState {
                variables: state.variables.clone(),
                step_records: state.step_records.clone(),
                results: Vec::new(),
                usage: TokenUsage::default(),
                turns: 0,
            }),
            deadline: self.deadline,
            stream: self.stream.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Fold a finished fork back in: its step records, results, usage and turns.
    /// Variables written inside a branch stay local to it.
    pub fn merge(&self, branch: ExecutionContext) {
        let branch = branch.state.into_inner().unwrap_or_else(|e| e.into_inner());
        let mut state = self.lock();
        state.step_records.extend(branch.step_records);
        state.results.extend(branch.results);
        state.usage.add(&branch.usage);
        state.turns += branch.turns;
    }

    /// Fresh context for a nested `run`: same deadline and stream, only `input` bound.
    pub fn nested(&self, input: Option<Value>) -> Self {
        let ctx = Self {
            state: Mutex::new(ContextState::default()),
            deadline: self.deadline,
            stream: self.stream.clone(),
            metadata: self.metadata.clone(),
        };
        if let Some(input) = input {
            ctx.set_var("input", input);
        }
        ctx
    }

    pub fn set_var(&self, name: impl Into<String>, value: Value) {
        self.lock().variables.insert(name.into(), value);
    }

    pub fn get_var(&self, name: &str) -> Option<Value> {
        self.lock().variables.get(name).cloned()
    }

    pub fn remove_var(&self, name: &str) -> Option<Value> {
        self.lock().variables.remove(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.lock().variables.contains_key(name)
    }

    /// Context variable first, then the process environment.
    pub fn lookup_variable(&self, name: &str) -> RuntimeResult<Value> {
        if let Some(value) = self.get_var(name) {
            return Ok(value);
        }
        std::env::var(name)
            .map(Value::String)
            .map_err(|_| RuntimeError::UnresolvedVariable(name.to_string()))
    }

    pub fn record_step(&self, name: &str, output: Value, usage: TokenUsage, duration: Duration) {
        let mut state = self.lock();
        state.usage.add(&usage);
        state.results.push(StepResult {
            name: name.to_string(),
            output: output.to_display_string(),
            usage,
            success: true,
            error: None,
            duration_ms: duration.as_millis() as u64,
        });
        state
            .step_records
            .insert(name.to_string(), StepRecord { output, usage });
    }

    pub fn record_failure(&self, name: &str, error: &RuntimeError, duration: Duration) {
        self.lock().results.push(StepResult {
            name: name.to_string(),
            output: String::new(),
            usage: TokenUsage::default(),
            success: false,
            error: Some(error.to_string()),
            duration_ms: duration.as_millis() as u64,
        });
    }

    /// Accepts `name`, `name.output` or `name.tokens`.
    pub fn step_record(&self, key: &str) -> Option<Value> {
        let state = self.lock();
        if let Some(record) = state.step_records.get(key) {
            return Some(record.output.clone());
        }
        let (name, field) = key.rsplit_once('.')?;
        let record = state.step_records.get(name)?;
        match field {
            "output" => Some(record.output.clone()),
            "tokens" => Some(record.usage.to_value()),
            _ => None,
        }
    }

    pub fn last_output(&self) -> Option<Value> {
        let state = self.lock();
        let last = state.results.iter().rev().find(|r| r.success)?;
        state.step_records.get(&last.name).map(|r| r.output.clone())
    }

    pub fn results(&self) -> Vec<StepResult> {
        self.lock().results.clone()
    }

    pub fn usage(&self) -> TokenUsage {
        self.lock().usage
    }

    /// Usage from a model call that is not recorded as a step.
    pub fn add_usage(&self, usage: &TokenUsage) {
        self.lock().usage.add(usage);
    }

    pub fn add_turn(&self) -> usize {
        let mut state = self.lock();
        state.turns += 1;
        state.turns
    }

    pub fn turns(&self) -> usize {
        self.lock().turns
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(sink) = &self.stream {
            sink(event);
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Run `fut` against the execution deadline.
    pub async fn with_deadline<T, F>(&self, what: &str, fut: F) -> RuntimeResult<T>
    where
        F: Future<Output = RuntimeResult<T>>,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(what.to_string())),
        }
    }
}
