//! Shared runtime handle: workspace, configuration, providers and MCP clients.

use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::mcp::{McpClient, McpLaunch, McpRegistry};
use crate::provider::{AnthropicProvider, OpenAiProvider, Provider, ProviderRegistry};
use crate::resolver::Resolver;
use flowlang::{EntityKind, RuntimeResult, Value, Workspace};
use std::sync::Arc;
use tracing::{debug, info};

struct RuntimeInner {
    workspace: Workspace,
    config: RuntimeConfig,
    providers: ProviderRegistry,
    mcp: McpRegistry,
}

/// Cheap to clone; clones share providers and MCP clients.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("entities", &self.inner.workspace.len())
            .field("providers", &self.inner.providers)
            .finish()
    }
}

impl Runtime {
    /// Runtime with no providers registered.
    pub fn new(workspace: Workspace, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                workspace,
                config,
                providers: ProviderRegistry::new(),
                mcp: McpRegistry::new(),
            }),
        }
    }

    /// Runtime with the HTTP providers whose API keys are available.
    pub fn from_config(workspace: Workspace, config: RuntimeConfig) -> Self {
        let openai_settings = config.providers.openai.clone().unwrap_or_default();
        let anthropic_settings = config.providers.anthropic.clone().unwrap_or_default();
        let runtime = Self::new(workspace, config);

        match OpenAiProvider::new(&openai_settings) {
            Ok(provider) => runtime.register_provider(Arc::new(provider)),
            Err(e) => debug!("OpenAI provider not registered: {}", e),
        }
        match AnthropicProvider::new(&anthropic_settings) {
            Ok(provider) => runtime.register_provider(Arc::new(provider)),
            Err(e) => debug!("Anthropic provider not registered: {}", e),
        }
        info!(providers = ?runtime.providers().names(), "runtime ready");
        runtime
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.inner.providers.register(provider);
    }

    pub fn workspace(&self) -> &Workspace {
        &self.inner.workspace
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn mcp(&self) -> &McpRegistry {
        &self.inner.mcp
    }

    /// Resolve a value outside any execution, against a fresh context.
    pub async fn evaluate(&self, value: &Value) -> RuntimeResult<Value> {
        let ctx = ExecutionContext::new(self.config().timeout());
        Resolver::new(self, &ctx).resolve(value).await
    }

    /// Client for the workspace `mcp` entity `name`, spawned on first use.
    pub async fn mcp_client(&self, name: &str) -> RuntimeResult<Arc<McpClient>> {
        if let Some(client) = self.inner.mcp.get(name).await {
            return Ok(client);
        }
        let entity = self.workspace().require(&EntityKind::Mcp, name)?;
        let launch = McpLaunch::from_entity(entity)?;
        self.inner
            .mcp
            .get_or_spawn(name, &launch, self.config().mcp_handshake)
            .await
    }

    /// Close every MCP server started by this runtime.
    pub async fn shutdown(&self) {
        self.inner.mcp.close_all().await;
    }
}
