use super::Provider;
use crate::config::RuntimeConfig;
use flowlang::{RuntimeError, RuntimeResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Named providers available to the engine.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the provider's own name, replacing any earlier entry.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.register_as(provider.name().to_string(), provider);
    }

    pub fn register_as(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Alphabetically first registered provider, the last fallback when routing a model.
    pub fn first(&self) -> Option<Arc<dyn Provider>> {
        let names = self.names();
        names.first().and_then(|name| self.get(name))
    }

    /// Pick the provider for `model`: the explicit `preferred` name, the model-prefix
    /// table, the configured default, the workspace default, then the first registered.
    pub fn route(
        &self,
        model: &str,
        preferred: Option<&str>,
        config: &RuntimeConfig,
        workspace_default: Option<&str>,
    ) -> RuntimeResult<Arc<dyn Provider>> {
        if let Some(name) = preferred {
            return self.get(name).ok_or_else(|| {
                RuntimeError::ProviderUnavailable(format!("provider '{}' is not registered", name))
            });
        }
        let candidates = [
            config.route_for(model),
            config.default_provider.as_deref(),
            workspace_default,
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(|name| self.get(name))
            .or_else(|| self.first())
            .ok_or_else(|| {
                RuntimeError::ProviderUnavailable(format!("no provider registered for '{}'", model))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StubProvider;

    #[test]
    fn lookup_and_fallback() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.first().is_none());
        registry.register(Arc::new(StubProvider::named("zeta")));
        registry.register(Arc::new(StubProvider::named("alpha")));
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert_eq!(registry.first().unwrap().name(), "alpha");
        assert!(registry.get("zeta").is_some());
        assert!(registry.get("openai").is_none());
    }

    #[test]
    fn routing_prefers_explicit_then_prefix_then_defaults() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider::named("anthropic")));
        registry.register(Arc::new(StubProvider::named("local")));
        let mut config = RuntimeConfig::default();

        let routed = registry.route("claude-3", None, &config, None).unwrap();
        assert_eq!(routed.name(), "anthropic");
        let routed = registry.route("claude-3", Some("local"), &config, None).unwrap();
        assert_eq!(routed.name(), "local");
        assert!(matches!(
            registry.route("claude-3", Some("openai"), &config, None),
            Err(RuntimeError::ProviderUnavailable(_))
        ));

        // gpt- routes to an unregistered openai and falls through
        let routed = registry.route("gpt-4o", None, &config, Some("local")).unwrap();
        assert_eq!(routed.name(), "local");
        config.default_provider = Some("anthropic".into());
        let routed = registry.route("gpt-4o", None, &config, Some("local")).unwrap();
        assert_eq!(routed.name(), "anthropic");
        let routed = registry.route("llama3", None, &RuntimeConfig::default(), None).unwrap();
        assert_eq!(routed.name(), "anthropic");
    }

    #[test]
    fn empty_registry_cannot_route() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.route("gpt-4o", None, &RuntimeConfig::default(), None),
            Err(RuntimeError::ProviderUnavailable(_))
        ));
    }
}
