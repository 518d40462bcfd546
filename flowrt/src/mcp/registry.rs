use super::client::McpClient;
use flowlang::{Entity, RuntimeError, RuntimeResult, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// How to start an MCP server process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct McpLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl McpLaunch {
    /// Read `command`, `args` and `env` from an `mcp` entity. Values are taken as
    /// literals; `env` entries are coerced to strings.
    pub fn from_entity(entity: &Entity) -> RuntimeResult<Self> {
        let command = entity
            .property("command")
            .map(Value::to_display_string)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RuntimeError::missing(entity.display_name(), "command"))?;
        let args = match entity.property("args") {
            Some(Value::Array(items)) => items.iter().map(Value::to_display_string).collect(),
            Some(other) => vec![other.to_display_string()],
            None => Vec::new(),
        };
        let env = match entity.property("env") {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.to_display_string()))
                .collect(),
            _ => HashMap::new(),
        };
        Ok(Self { command, args, env })
    }
}

/// Clients keyed by server name, spawned on first use and kept for the runtime's life.
#[derive(Debug, Default)]
pub struct McpRegistry {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached client for `name`, unless it was left out of sync.
    pub async fn get(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients
            .read()
            .await
            .get(name)
            .filter(|client| !client.is_broken())
            .cloned()
    }

    pub async fn insert(&self, client: Arc<McpClient>) {
        self.clients
            .write()
            .await
            .insert(client.name().to_string(), client);
    }

    /// Cached client for `name`, or a freshly spawned one. The process is started and
    /// the handshake run without holding the registry lock; when two callers race, the
    /// first client stored wins and the other is closed.
    pub async fn get_or_spawn(
        &self,
        name: &str,
        launch: &McpLaunch,
        handshake: bool,
    ) -> RuntimeResult<Arc<McpClient>> {
        if let Some(client) = self.get(name).await {
            return Ok(client);
        }
        info!(server = %name, command = %launch.command, "starting MCP server");
        let client = Arc::new(McpClient::spawn(
            name,
            &launch.command,
            &launch.args,
            &launch.env,
        )?);
        if handshake {
            client.initialize().await?;
        }

        let existing = {
            let mut clients = self.clients.write().await;
            match clients.get(name) {
                Some(current) if !current.is_broken() => Some(current.clone()),
                _ => {
                    clients.insert(name.to_string(), client.clone());
                    None
                }
            }
        };
        match existing {
            Some(current) => {
                if let Err(e) = client.close().await {
                    warn!(server = %name, error = %e, "failed to close duplicate MCP server");
                }
                Ok(current)
            }
            None => Ok(client),
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn close_all(&self) {
        let clients: Vec<Arc<McpClient>> = self
            .clients
            .write()
            .await
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in clients {
            if let Err(e) = client.close().await {
                warn!(server = %client.name(), error = %e, "failed to close MCP server");
            }
        }
    }
}
