//! Method calls: reserved integration namespaces, object keys and entity methods.

use super::Resolver;
use flowlang::{RuntimeError, RuntimeResult, Value};
use tracing::debug;

/// Namespaces whose methods are answered by integration stubs instead of resolving
/// the receiver.
const RESERVED_NAMESPACES: [&str; 2] = ["git", "github"];

/// Namespace name if `receiver` is a bare reserved identifier.
pub(crate) fn reserved_namespace(receiver: &Value) -> Option<&str> {
    let name = match receiver {
        Value::Variable(name) => name.as_str(),
        Value::PropertyAccess { base, .. } => base.as_str(),
        _ => return None,
    };
    RESERVED_NAMESPACES.contains(&name).then_some(name)
}

// TODO: wire git/github to real clients; until then only the read-only queries answer.
pub(crate) fn call_integration(namespace: &str, method: &str) -> RuntimeResult<Value> {
    match (namespace, method) {
        ("git", "status" | "diff" | "log") => Ok(Value::String(String::new())),
        ("github", "issues" | "pulls") => Ok(Value::Array(Vec::new())),
        _ => Err(RuntimeError::NotImplemented(format!(
            "{}.{}()",
            namespace, method
        ))),
    }
}

impl Resolver<'_> {
    pub(crate) async fn call_method(
        &self,
        receiver: &Value,
        method: &str,
        args: &[Value],
        body: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if let Some(namespace) = reserved_namespace(receiver) {
            return call_integration(namespace, method);
        }

        let target = self.resolve(receiver).await?;
        let mut resolved_args = Vec::with_capacity(args.len());
        for arg in args {
            resolved_args.push(self.resolve(arg).await?);
        }

        match target {
            Value::Object(map) => map
                .get(method)
                .cloned()
                .ok_or_else(|| RuntimeError::KeyNotFound(method.to_string())),
            Value::NestedEntity(entity) => match method {
                "run" | "execute" => {
                    let input = match (resolved_args.into_iter().next(), body) {
                        (Some(first), _) => Some(first),
                        (None, Some(body)) => Some(self.resolve(body).await?),
                        (None, None) => None,
                    };
                    debug!(entity = %entity.display_name(), "method call re-enters engine");
                    let nested = self.ctx.nested(input.clone());
                    let output = self.runtime.run_entity(&entity, &nested, input).await;
                    self.ctx.add_usage(&nested.usage());
                    output
                }
                property => match entity.property(property) {
                    Some(value) => self.resolve(value).await,
                    None => entity
                        .metadata(property)
                        .map(Value::from)
                        .ok_or_else(|| {
                            RuntimeError::KeyNotFound(format!("{}.{}", entity.name(), property))
                        }),
                },
            },
            other => Err(RuntimeError::TypeError(format!(
                "cannot call '{}' on {} value",
                method,
                other.type_name()
            ))),
        }
    }
}
