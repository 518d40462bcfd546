// flowlang
// Entity and value model consumed by the flowrt runtime.

pub mod ast;
pub mod error;
pub mod registry;
pub mod workspace;

pub use ast::{CompareOp, Entity, EntityKind, SourceLocation, Value};
pub use error::{RuntimeError, RuntimeResult};
pub use registry::EntityRegistry;
pub use workspace::Workspace;
