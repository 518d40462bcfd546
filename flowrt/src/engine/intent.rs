//! Intent tool loop.
//!
//! `BUILD_PROMPT -> CALL_MODEL -> (DONE | EXECUTE_TOOLS -> CALL_MODEL)`, bounded by
//! `max_tool_turns`. Tool failures are fed back to the model as text; model and
//! provider failures end the run.

use super::tools::Toolbox;
use crate::context::{ExecutionContext, StreamEvent};
use crate::provider::{CompletionRequest, Message};
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use flowlang::{Entity, RuntimeError, RuntimeResult, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, warn};

impl Runtime {
    pub(crate) async fn run_intent(
        &self,
        intent: &Entity,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<Value> {
        self.bind_params(intent, ctx).await?;
        let resolver = Resolver::new(self, ctx);

        let prompt = match resolver.property_string(intent, "prompt").await? {
            Some(prompt) => prompt,
            None => match resolver.property_string(intent, "goal").await? {
                Some(goal) => goal,
                None => ctx
                    .get_var("input")
                    .map(|input| input.to_display_string())
                    .ok_or_else(|| RuntimeError::missing(intent.display_name(), "prompt"))?,
            },
        };

        let profile = self.agent_for(intent, None, ctx).await?;
        let toolbox = Toolbox::build(self, intent, ctx).await?;
        let max_turns = self.config().max_tool_turns.max(1);

        let mut messages = vec![Message::user(prompt)];
        let mut last_content = String::new();

        for turn in 1..=max_turns {
            ctx.add_turn();
            let request = CompletionRequest {
                messages: messages.clone(),
                tools: toolbox.definitions().to_vec(),
                ..profile.request()
            };
            let response = self.call_model(&profile, &request, ctx).await?;
            ctx.add_usage(&response.usage);
            last_content = response.content.clone();

            if !response.wants_tools() {
                debug!(intent = %intent.name(), turn, "intent finished");
                return Ok(Value::String(response.content));
            }

            messages.push(Message::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let started = Instant::now();
                let step_name = format!("tool:{}", call.name);
                let text = match toolbox.invoke(self, call, ctx).await {
                    Ok(output) => {
                        ctx.record_step(
                            &step_name,
                            Value::String(output.clone()),
                            Default::default(),
                            started.elapsed(),
                        );
                        ctx.emit(StreamEvent::ToolCall {
                            tool: call.name.clone(),
                            success: true,
                        });
                        output
                    }
                    Err(e) => {
                        debug!(tool = %call.name, error = %e, "tool call failed");
                        ctx.record_failure(&step_name, &e, started.elapsed());
                        ctx.emit(StreamEvent::ToolCall {
                            tool: call.name.clone(),
                            success: false,
                        });
                        format!("Error: {}", e)
                    }
                };
                messages.push(Message::tool_result(&call.id, &call.name, text));
            }
        }

        warn!(
            intent = %intent.name(),
            turns = max_turns,
            "tool loop reached the turn cap"
        );
        if self.config().fail_on_turn_cap {
            return Err(RuntimeError::TurnLimitExceeded(max_turns));
        }
        Ok(Value::String(last_content))
    }

    /// Bind the intent's declared `params` as the `params` variable. Input object keys
    /// win over defaults.
    async fn bind_params(&self, intent: &Entity, ctx: &ExecutionContext) -> RuntimeResult<()> {
        let Some(Value::Object(declared)) = intent.property("params") else {
            return Ok(());
        };
        let input: HashMap<String, Value> = match ctx.get_var("input") {
            Some(Value::Object(map)) => map,
            _ => HashMap::new(),
        };
        let resolver = Resolver::new(self, ctx);
        let sorted: BTreeMap<&String, &Value> = declared.iter().collect();
        let mut bound = HashMap::new();
        for (name, declaration) in sorted {
            if let Some(value) = input.get(name) {
                bound.insert(name.clone(), value.clone());
                continue;
            }
            match declaration {
                Value::TypedParameter {
                    default: Some(default),
                    ..
                } => {
                    bound.insert(name.clone(), resolver.resolve(default).await?);
                }
                Value::TypedParameter { required: true, .. } => {
                    return Err(RuntimeError::missing(
                        intent.display_name(),
                        format!("params.{}", name),
                    ))
                }
                Value::TypedParameter { .. } => {}
                literal => {
                    bound.insert(name.clone(), resolver.resolve(literal).await?);
                }
            }
        }
        ctx.set_var("params", Value::Object(bound));
        Ok(())
    }
}
