use crate::context::{ExecutionContext, StreamEvent};
use crate::provider::{CompletionRequest, CompletionResponse, StreamHandler};
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use flowlang::{Entity, RuntimeError, RuntimeResult, Value};
use tracing::debug;

const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Model settings of an agent after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    /// Explicit provider name; routing applies when unset
    pub provider: Option<String>,
}

impl AgentProfile {
    pub fn request(&self) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            system: Some(self.system_prompt.clone()),
            temperature: Some(self.temperature),
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }
}

/// Forwards provider chunks to the execution's stream sink.
struct ChunkForwarder<'a> {
    ctx: &'a ExecutionContext,
}

impl StreamHandler for ChunkForwarder<'_> {
    fn on_chunk(&self, chunk: &str) {
        self.ctx.emit(StreamEvent::Chunk {
            content: chunk.to_string(),
        });
    }

    fn on_complete(&self, response: &CompletionResponse) {
        debug!(model = %response.model, "stream complete");
    }

    fn on_error(&self, error: &RuntimeError) {
        debug!(error = %error, "stream failed");
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Runtime {
    /// Resolve the agent named by `holder`'s `use` property, or by `inherited` when the
    /// holder has none.
    pub(crate) async fn agent_for(
        &self,
        holder: &Entity,
        inherited: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<AgentProfile> {
        let resolver = Resolver::new(self, ctx);
        let use_value = holder
            .property("use")
            .or(inherited)
            .ok_or_else(|| RuntimeError::missing(holder.display_name(), "use"))?;

        let agent = match resolver.resolve(use_value).await? {
            Value::NestedEntity(entity) => *entity,
            Value::String(name) => self
                .workspace()
                .agent(&name)
                .cloned()
                .ok_or_else(|| RuntimeError::not_found("agent", name))?,
            other => {
                return Err(RuntimeError::TypeError(format!(
                    "'use' must name an agent, got {}",
                    other.type_name()
                )))
            }
        };

        let mut system_prompt = None;
        for key in ["instruction", "system_prompt", "prompt"] {
            if let Some(text) = resolver.property_string(&agent, key).await? {
                system_prompt = Some(text);
                break;
            }
        }
        let system_prompt = system_prompt
            .unwrap_or_else(|| format!("You are {}, a helpful assistant.", agent.name()));

        let model = resolver
            .property_string(&agent, "model")
            .await?
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.config().default_model.clone());

        let temperature = match agent.property("temperature") {
            Some(value) => as_number(&resolver.resolve(value).await?),
            None => None,
        }
        .unwrap_or(DEFAULT_TEMPERATURE);

        let max_tokens = match agent.property("max_tokens") {
            Some(value) => as_number(&resolver.resolve(value).await?).map(|n| n as u32),
            None => None,
        };

        let provider = resolver
            .property_string(&agent, "provider")
            .await?
            .filter(|p| !p.is_empty());

        Ok(AgentProfile {
            name: agent.name().to_string(),
            system_prompt,
            model,
            temperature,
            max_tokens,
            provider,
        })
    }

    /// One model call under the execution deadline, streamed when the caller listens.
    pub(crate) async fn call_model(
        &self,
        profile: &AgentProfile,
        request: &CompletionRequest,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<CompletionResponse> {
        let workspace_default = self
            .workspace()
            .config()
            .and_then(|c| c.property("default_provider"))
            .map(Value::to_display_string);
        let provider = self.providers().route(
            &profile.model,
            profile.provider.as_deref(),
            self.config(),
            workspace_default.as_deref(),
        )?;
        debug!(
            agent = %profile.name,
            provider = %provider.name(),
            model = %request.model,
            messages = request.messages.len(),
            "calling model"
        );

        if ctx.is_streaming() {
            let forwarder = ChunkForwarder { ctx };
            ctx.with_deadline("model call", provider.complete_stream(request, &forwarder))
                .await
        } else {
            ctx.with_deadline("model call", provider.complete(request))
                .await
        }
    }
}
