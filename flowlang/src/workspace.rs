//! Indexed, read-only collection of entities.

use crate::ast::{Entity, EntityKind};
use crate::error::{RuntimeError, RuntimeResult};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Workspace {
    entities: HashMap<(EntityKind, String), Entity>,
    /// Insertion order, so scans such as the trigger poll are stable.
    order: Vec<(EntityKind, String)>,
    config: Option<Entity>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut ws = Self::new();
        for entity in entities {
            ws.insert(entity);
        }
        ws
    }

    /// Load a JSON array of entities.
    pub fn from_json_str(json: &str) -> RuntimeResult<Self> {
        let entities: Vec<Entity> = serde_json::from_str(json)?;
        Ok(Self::from_entities(entities))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RuntimeError::Io(format!(
                "Failed to read workspace {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    /// Inserts an entity, replacing any previous one with the same kind and name.
    /// The unnamed `config` entity is a singleton.
    pub fn insert(&mut self, entity: Entity) {
        if entity.kind == EntityKind::Config {
            self.config = Some(entity);
            return;
        }
        let key = (entity.kind.clone(), entity.name().to_string());
        if !self.entities.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entities.insert(key, entity);
    }

    pub fn get(&self, kind: &EntityKind, name: &str) -> Option<&Entity> {
        if *kind == EntityKind::Config {
            return self.config.as_ref();
        }
        self.entities.get(&(kind.clone(), name.to_string()))
    }

    pub fn require(&self, kind: &EntityKind, name: &str) -> RuntimeResult<&Entity> {
        self.get(kind, name)
            .ok_or_else(|| RuntimeError::not_found(kind.as_str(), name))
    }

    pub fn agent(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Agent, name)
    }

    pub fn tool(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Tool, name)
    }

    pub fn intent(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Intent, name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Pipeline, name)
    }

    pub fn script(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Script, name)
    }

    pub fn file(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::File, name)
    }

    pub fn mcp_server(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Mcp, name)
    }

    pub fn trigger(&self, name: &str) -> Option<&Entity> {
        self.get(&EntityKind::Trigger, name)
    }

    pub fn config(&self) -> Option<&Entity> {
        self.config.as_ref()
    }

    pub fn entities_of(&self, kind: EntityKind) -> Vec<&Entity> {
        if kind == EntityKind::Config {
            return self.config.iter().collect();
        }
        self.order
            .iter()
            .filter(|(k, _)| *k == kind)
            .filter_map(|key| self.entities.get(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + usize::from(self.config.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
