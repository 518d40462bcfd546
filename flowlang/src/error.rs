//! Error taxonomy shared by the model, resolver and runtime.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("{kind} '{name}' not found")]
    EntityNotFound { kind: String, name: String },

    #[error("Unsupported entity type: {0}")]
    UnsupportedEntityType(String),

    #[error("{entity} is missing required property '{property}'")]
    MissingProperty { entity: String, property: String },

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("Unresolved variable: {0}")]
    UnresolvedVariable(String),

    #[error("Key or property not found: {0}")]
    KeyNotFound(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("No provider available: {0}")]
    ProviderUnavailable(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Recoverable inside the intent tool loop; the message is fed back to the model.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecutionFailed { tool: String, message: String },

    #[error("MCP error {code}: {message}")]
    McpProtocol { code: i64, message: String },

    #[error("Tool loop stopped after {0} turns without a final answer")]
    TurnLimitExceeded(usize),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RuntimeError {
    pub fn missing(entity: impl Into<String>, property: impl Into<String>) -> Self {
        RuntimeError::MissingProperty {
            entity: entity.into(),
            property: property.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        RuntimeError::EntityNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn step_failed(step: impl Into<String>, source: RuntimeError) -> Self {
        RuntimeError::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Name of the step that failed, if this error was raised from a pipeline step.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            RuntimeError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_names_the_step() {
        let err = RuntimeError::step_failed("b", RuntimeError::RequestFailed("boom".into()));
        assert_eq!(err.failed_step(), Some("b"));
        assert_eq!(err.to_string(), "Step 'b' failed: Request failed: boom");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RuntimeError = io.into();
        assert!(matches!(err, RuntimeError::Io(msg) if msg.contains("gone")));
    }
}
