// flowrt
// Executes agent, intent, pipeline, script and tool entities from a flowlang workspace.

pub mod config;
pub mod context;
pub mod engine;
pub mod mcp;
pub mod provider;
pub mod resolver;
pub mod runtime;
pub mod trigger;

pub use config::RuntimeConfig;
pub use context::{ExecutionContext, StepResult, StreamEvent, StreamSink};
pub use engine::{ExecuteOptions, ExecutionError, ExecutionResult};
pub use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value, Workspace};
pub use provider::{Provider, ProviderRegistry, StubProvider, TokenUsage};
pub use resolver::Resolver;
pub use runtime::Runtime;
pub use trigger::{TriggerEngine, TriggerHandle};
