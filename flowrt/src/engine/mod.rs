//! Execution Engine
//!
//! Dispatches entities by kind. Each [`Runtime::execute`] call owns a fresh
//! [`ExecutionContext`]; nested runs (`run` steps, `.run()` method calls) get their own
//! context sharing the caller's deadline and stream sink.

mod agent;
mod control;
mod intent;
mod pipeline;
mod script;
mod tools;

pub use agent::AgentProfile;
pub use tools::substitute_arguments;

use crate::context::{ExecutionContext, StepResult, StreamEvent, StreamSink};
use crate::provider::TokenUsage;
use crate::runtime::Runtime;
use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub input: Option<Value>,
    pub stream: Option<StreamSink>,
    /// Falls back to the configured `timeout_seconds`
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

impl ExecuteOptions {
    pub fn with_input(input: Value) -> Self {
        Self {
            input: Some(input),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("input", &self.input)
            .field("streaming", &self.stream.is_some())
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub entity: String,
    pub kind: String,
    pub output: Value,
    pub steps: Vec<StepResult>,
    pub usage: TokenUsage,
    /// Model calls made by intent tool loops
    pub turns: usize,
    pub metadata: HashMap<String, String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A failed execution together with everything recorded before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionError {
    pub error: RuntimeError,
    pub partial: Box<ExecutionResult>,
}

impl Runtime {
    pub async fn execute(
        &self,
        entity: &Entity,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutionError> {
        let timeout = options.timeout.unwrap_or_else(|| self.config().timeout());
        let mut ctx = ExecutionContext::new(timeout).with_metadata(options.metadata.clone());
        if let Some(sink) = options.stream.clone() {
            ctx = ctx.with_stream(sink);
        }
        if let Some(input) = &options.input {
            ctx.set_var("input", input.clone());
        }

        let execution_id = Uuid::new_v4();
        let started = Instant::now();
        info!(%execution_id, entity = %entity.display_name(), "execution started");
        ctx.emit(StreamEvent::Started {
            entity: entity.display_name(),
        });

        let outcome = self.run_entity(entity, &ctx, options.input).await;

        let output = match &outcome {
            Ok(output) => output.clone(),
            Err(_) => ctx.last_output().unwrap_or_else(|| Value::from("")),
        };
        let result = ExecutionResult {
            execution_id,
            entity: entity.name().to_string(),
            kind: entity.kind.to_string(),
            output,
            steps: ctx.results(),
            usage: ctx.usage(),
            turns: ctx.turns(),
            metadata: ctx.metadata().clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            Ok(_) => {
                info!(
                    %execution_id,
                    duration_ms = result.duration_ms,
                    tokens = result.usage.total_tokens,
                    "execution finished"
                );
                ctx.emit(StreamEvent::Finished {
                    output: result.output.to_display_string(),
                });
                Ok(result)
            }
            Err(error) => {
                warn!(%execution_id, error = %error, "execution failed");
                ctx.emit(StreamEvent::Error {
                    message: error.to_string(),
                });
                Err(ExecutionError {
                    error,
                    partial: Box::new(result),
                })
            }
        }
    }

    /// Run `entity` in `ctx`. `input` feeds script params and tool arguments; intents and
    /// pipelines read the context's `input` variable instead.
    pub(crate) fn run_entity<'a>(
        &'a self,
        entity: &'a Entity,
        ctx: &'a ExecutionContext,
        input: Option<Value>,
    ) -> BoxFuture<'a, RuntimeResult<Value>> {
        Box::pin(async move {
            match &entity.kind {
                EntityKind::Intent => self.run_intent(entity, ctx).await,
                EntityKind::Pipeline => self.run_pipeline(entity, ctx).await,
                EntityKind::Script => {
                    let params = input_object(input.as_ref());
                    self.run_script(entity, ctx, params).await
                }
                EntityKind::Tool => {
                    let args = input.as_ref().map(Value::to_json).unwrap_or_default();
                    self.run_tool(entity, ctx, &args).await.map(Value::String)
                }
                EntityKind::Step => self.run_step(entity, ctx, None).await,
                EntityKind::Parallel => self.run_parallel(entity, ctx, None).await,
                EntityKind::Agent
                | EntityKind::File
                | EntityKind::Config
                | EntityKind::Mcp
                | EntityKind::Trigger
                | EntityKind::Other(_) => {
                    Err(RuntimeError::UnsupportedEntityType(entity.kind.to_string()))
                }
            }
        })
    }
}

/// Keys of an object input, for merging over declared parameters.
pub(crate) fn input_object(input: Option<&Value>) -> HashMap<String, Value> {
    match input {
        Some(Value::Object(map)) => map.clone(),
        _ => HashMap::new(),
    }
}
