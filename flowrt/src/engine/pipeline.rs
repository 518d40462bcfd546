use crate::context::{ExecutionContext, StreamEvent};
use crate::provider::{CompletionRequest, Message, TokenUsage};
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

/// Name a step is recorded under.
pub(crate) fn step_name(step: &Entity, index: usize) -> String {
    match &step.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("step{}", index + 1),
    }
}

impl Runtime {
    /// Steps in declaration order, fail fast; then the `parallel`, `branch` and `loop`
    /// blocks, always in that order.
    pub(crate) async fn run_pipeline(
        &self,
        pipeline: &Entity,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<Value> {
        info!(pipeline = %pipeline.name(), "running pipeline");
        let inherited = pipeline.property("use");
        for (index, step) in pipeline.steps().enumerate() {
            self.run_named_step(step, &step_name(step, index), ctx, inherited)
                .await?;
        }
        self.run_blocks(pipeline, ctx, inherited).await?;

        match pipeline.property("output") {
            Some(output) => Resolver::new(self, ctx).resolve(output).await,
            None => Ok(ctx.last_output().unwrap_or_else(|| Value::from(""))),
        }
    }

    /// A single step outside a pipeline.
    pub(crate) async fn run_step(
        &self,
        step: &Entity,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<Value> {
        self.run_named_step(step, &step_name(step, 0), ctx, inherited)
            .await
    }

    /// Execute, record and apply `set` for one step. A failure is recorded and returned
    /// as `StepFailed` naming the step.
    pub(crate) async fn run_named_step(
        &self,
        step: &Entity,
        name: &str,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<Value> {
        ctx.emit(StreamEvent::StepStarted {
            step: name.to_string(),
        });
        let started = Instant::now();

        let outcome: RuntimeResult<(Value, TokenUsage)> = async {
            let (output, usage) = self.execute_step(step, ctx, inherited).await?;
            self.apply_set(step, ctx, &output).await?;
            Ok((output, usage))
        }
        .await;

        match outcome {
            Ok((output, usage)) => {
                debug!(step = %name, tokens = usage.total_tokens, "step completed");
                ctx.record_step(name, output.clone(), usage, started.elapsed());
                ctx.emit(StreamEvent::StepCompleted {
                    step: name.to_string(),
                    output: output.to_display_string(),
                });
                Ok(output)
            }
            Err(e) => {
                ctx.record_failure(name, &e, started.elapsed());
                Err(RuntimeError::step_failed(name, e))
            }
        }
    }

    async fn execute_step(
        &self,
        step: &Entity,
        ctx: &ExecutionContext,
        inherited: Option<&Value>,
    ) -> RuntimeResult<(Value, TokenUsage)> {
        let resolver = Resolver::new(self, ctx);

        if let Some(target) = step.property("run") {
            let target = match resolver.resolve(target).await? {
                Value::NestedEntity(entity) => *entity,
                other => self.runnable_by_name(&other.to_display_string())?,
            };
            let input = match step.property("input") {
                Some(value) => Some(resolver.resolve(value).await?),
                None => ctx.get_var("input"),
            };
            let nested = ctx.nested(input.clone());
            let output = self.run_entity(&target, &nested, input).await?;
            return Ok((output, nested.usage()));
        }

        let Some(prompt) = step.property("prompt") else {
            return match step.property("output") {
                Some(output) => Ok((resolver.resolve(output).await?, TokenUsage::default())),
                None => Err(RuntimeError::missing(step.display_name(), "prompt")),
            };
        };

        let prompt = resolver.resolve_string(prompt).await?;
        let mut profile = self.agent_for(step, inherited, ctx).await?;
        if let Some(system) = resolver.property_string(step, "system_prompt").await? {
            profile.system_prompt = system;
        }
        let request = CompletionRequest {
            messages: vec![Message::user(prompt)],
            ..profile.request()
        };
        let response = self.call_model(&profile, &request, ctx).await?;
        Ok((Value::String(response.content), response.usage))
    }

    /// Bind each key of the step's `set` object. `output` inside refers to this step.
    async fn apply_set(
        &self,
        step: &Entity,
        ctx: &ExecutionContext,
        output: &Value,
    ) -> RuntimeResult<()> {
        let Some(Value::Object(assignments)) = step.property("set") else {
            return Ok(());
        };
        let previous = ctx.get_var("output");
        ctx.set_var("output", output.clone());
        let resolver = Resolver::new(self, ctx);
        let sorted: BTreeMap<&String, &Value> = assignments.iter().collect();
        let mut resolved = Vec::with_capacity(sorted.len());
        let mut failure = None;
        for (key, value) in sorted {
            match resolver.resolve(value).await {
                Ok(value) => resolved.push((key.clone(), value)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        match previous {
            Some(previous) => ctx.set_var("output", previous),
            None => {
                ctx.remove_var("output");
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        for (key, value) in resolved {
            ctx.set_var(key, value);
        }
        Ok(())
    }

    fn runnable_by_name(&self, name: &str) -> RuntimeResult<Entity> {
        let workspace = self.workspace();
        [
            EntityKind::Pipeline,
            EntityKind::Intent,
            EntityKind::Script,
            EntityKind::Tool,
        ]
        .iter()
        .find_map(|kind| workspace.get(kind, name))
        .cloned()
        .ok_or_else(|| RuntimeError::not_found("runnable", name))
    }
}
