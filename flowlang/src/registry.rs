//! Entity-kind registry
//!
//! Maps a type name to a constructor so that callers can introduce new entity kinds
//! at startup. The resolver never consults this table.

use crate::ast::{Entity, EntityKind, SourceLocation};
use crate::error::{RuntimeError, RuntimeResult};
use std::collections::HashMap;

pub type EntityFactory = fn(Option<String>, SourceLocation) -> Entity;

#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    factories: HashMap<String, EntityFactory>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the eleven built-in kinds.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        for kind in [
            "file", "agent", "tool", "intent", "pipeline", "parallel", "step", "trigger",
            "mcp", "script",
        ] {
            registry.register(kind, named_factory);
        }
        registry.register("config", config_factory);
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, factory: EntityFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn create(
        &self,
        type_name: &str,
        name: Option<String>,
        location: SourceLocation,
    ) -> RuntimeResult<Entity> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| RuntimeError::UnsupportedEntityType(type_name.to_string()))?;
        let mut entity = factory(name, location);
        // Factories for custom kinds may leave the tag generic; pin it to the registered name.
        if entity.kind.as_str() != type_name {
            entity.kind = EntityKind::from(type_name);
        }
        Ok(entity)
    }
}

fn named_factory(name: Option<String>, location: SourceLocation) -> Entity {
    Entity {
        kind: EntityKind::Other(String::new()),
        name,
        properties: HashMap::new(),
        metadata: HashMap::new(),
        children: Vec::new(),
        location,
    }
}

fn config_factory(_name: Option<String>, location: SourceLocation) -> Entity {
    let mut entity = Entity::unnamed(EntityKind::Config);
    entity.location = location;
    entity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = EntityRegistry::with_builtin_kinds();
        assert_eq!(registry.kinds().len(), 11);
        let pipeline = registry
            .create("pipeline", Some("release".into()), SourceLocation { line: 3, column: 1 })
            .unwrap();
        assert_eq!(pipeline.kind, EntityKind::Pipeline);
        assert_eq!(pipeline.name(), "release");
        assert_eq!(pipeline.location.line, 3);
    }

    #[test]
    fn config_is_unnamed() {
        let registry = EntityRegistry::with_builtin_kinds();
        let config = registry
            .create("config", Some("ignored".into()), SourceLocation::default())
            .unwrap();
        assert_eq!(config.kind, EntityKind::Config);
        assert!(config.name.is_none());
    }

    #[test]
    fn custom_kinds_can_be_added() {
        fn webhook(name: Option<String>, location: SourceLocation) -> Entity {
            let mut e = Entity::new(EntityKind::from("webhook"), name.unwrap_or_default());
            e.location = location;
            e
        }
        let mut registry = EntityRegistry::with_builtin_kinds();
        assert!(registry.create("webhook", None, SourceLocation::default()).is_err());
        registry.register("webhook", webhook);
        let entity = registry
            .create("webhook", Some("deploy".into()), SourceLocation::default())
            .unwrap();
        assert_eq!(entity.kind, EntityKind::Other("webhook".into()));
    }
}
