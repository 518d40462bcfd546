//! Expression Resolver
//!
//! Reduces a [`Value`] to a concrete value against the workspace and an execution
//! context. Every form is matched exhaustively in [`Resolver::resolve`].
//!
//! Failure policy differs by form: direct variables, references and property chains
//! fail closed, while `{{ }}` interpolation inside strings fails open.

mod functions;
mod interpolate;
mod methods;
pub mod path;

pub use path::get_nested_value;

use crate::context::ExecutionContext;
use crate::runtime::Runtime;
use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value};
use futures::future::BoxFuture;
use std::collections::HashMap;

pub struct Resolver<'a> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) ctx: &'a ExecutionContext,
}

impl<'a> Resolver<'a> {
    pub fn new(runtime: &'a Runtime, ctx: &'a ExecutionContext) -> Self {
        Self { runtime, ctx }
    }

    pub fn resolve<'b>(&'b self, value: &'b Value) -> BoxFuture<'b, RuntimeResult<Value>> {
        Box::pin(async move {
            match value {
                Value::String(text) => Ok(Value::String(self.interpolate(text))),
                Value::Number(_) | Value::Bool(_) => Ok(value.clone()),
                Value::Array(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(self.resolve(item).await?);
                    }
                    Ok(Value::Array(resolved))
                }
                Value::Object(map) => {
                    let mut resolved = HashMap::with_capacity(map.len());
                    for (key, item) in map {
                        resolved.insert(key.clone(), self.resolve(item).await?);
                    }
                    Ok(Value::Object(resolved))
                }
                Value::Variable(name) => self.ctx.lookup_variable(name),
                Value::Reference { kind, name, path } => {
                    self.resolve_reference(kind, name, path).await
                }
                Value::PropertyAccess { base, path } => self.property_access(base, path),
                Value::MethodCall {
                    receiver,
                    method,
                    args,
                    body,
                } => {
                    self.call_method(receiver, method, args, body.as_deref())
                        .await
                }
                Value::FunctionCall { name, args } => {
                    let mut resolved = Vec::with_capacity(args.len());
                    for arg in args {
                        resolved.push(self.resolve(arg).await?);
                    }
                    functions::call_function(self.ctx, name, resolved).await
                }
                Value::Comparison { left, op, right } => {
                    let left = self.resolve_string(left).await?;
                    let right = self.resolve_string(right).await?;
                    Ok(Value::Bool(op.apply(&left, &right)))
                }
                Value::NestedEntity(_)
                | Value::TypedParameter { .. }
                | Value::Branch { .. }
                | Value::Loop { .. } => Ok(value.clone()),
            }
        })
    }

    pub async fn resolve_string(&self, value: &Value) -> RuntimeResult<String> {
        Ok(self.resolve(value).await?.to_display_string())
    }

    /// Resolve an optional property of `holder` to a string.
    pub async fn property_string(
        &self,
        holder: &Entity,
        key: &str,
    ) -> RuntimeResult<Option<String>> {
        match holder.property(key) {
            Some(value) => Ok(Some(self.resolve_string(value).await?)),
            None => Ok(None),
        }
    }

    /// `base.path...` where base is `step`, `env`, `date` or a context variable.
    pub(crate) fn property_access(&self, base: &str, path: &[String]) -> RuntimeResult<Value> {
        match base {
            "step" => {
                let (name, rest) = path
                    .split_first()
                    .ok_or_else(|| RuntimeError::UnresolvedReference("step".to_string()))?;
                self.step_value(name, rest)
            }
            "env" => {
                let var = path
                    .first()
                    .ok_or_else(|| RuntimeError::UnresolvedReference("env".to_string()))?;
                std::env::var(var)
                    .map(Value::String)
                    .map_err(|_| RuntimeError::UnresolvedReference(format!("env.{}", var)))
            }
            "date" => {
                let field = path
                    .first()
                    .ok_or_else(|| RuntimeError::KeyNotFound("date".to_string()))?;
                path::date_field(field)
            }
            variable => {
                let value = self
                    .ctx
                    .get_var(variable)
                    .ok_or_else(|| RuntimeError::UnresolvedVariable(variable.to_string()))?;
                get_nested_value(&value, path)
            }
        }
    }

    /// Step record lookup: bare name, `.output[...]` or `.tokens[...]`.
    fn step_value(&self, name: &str, rest: &[String]) -> RuntimeResult<Value> {
        let missing = || RuntimeError::UnresolvedReference(format!("step.{}", name));
        match rest.split_first() {
            Some((field, tail)) if field == "output" || field == "tokens" => {
                let record = self
                    .ctx
                    .step_record(&format!("{}.{}", name, field))
                    .ok_or_else(missing)?;
                get_nested_value(&record, tail)
            }
            _ => {
                let record = self.ctx.step_record(name).ok_or_else(missing)?;
                get_nested_value(&record, rest)
            }
        }
    }

    async fn resolve_reference(
        &self,
        kind: &str,
        name: &str,
        path: &[String],
    ) -> RuntimeResult<Value> {
        let workspace = self.runtime.workspace();
        match kind {
            "step" => self.step_value(name, path),
            "agent" | "tool" | "pipeline" | "intent" | "script" | "mcp" | "trigger" => {
                let entity = workspace.require(&EntityKind::from(kind), name)?;
                let value = Value::entity(entity.clone());
                if path.is_empty() {
                    return Ok(value);
                }
                let field = get_nested_value(&value, path)?;
                self.resolve(&field).await
            }
            "file" => {
                let entity = workspace.require(&EntityKind::File, name)?;
                if !path.is_empty() {
                    let field = get_nested_value(&Value::entity(entity.clone()), path)?;
                    return self.resolve(&field).await;
                }
                if let Some(content) = entity.property("content") {
                    return self.resolve(content).await;
                }
                let file_path = self
                    .property_string(entity, "path")
                    .await?
                    .ok_or_else(|| RuntimeError::missing(entity.display_name(), "path"))?;
                tokio::fs::read_to_string(&file_path)
                    .await
                    .map(Value::String)
                    .map_err(|e| RuntimeError::Io(format!("Failed to read {}: {}", file_path, e)))
            }
            "env" => std::env::var(name)
                .map(Value::String)
                .map_err(|_| RuntimeError::UnresolvedReference(format!("env.{}", name))),
            "config" => {
                let config = workspace
                    .config()
                    .ok_or_else(|| RuntimeError::not_found("config", name))?;
                let mut full_path = Vec::with_capacity(path.len() + 1);
                if !name.is_empty() {
                    full_path.push(name.to_string());
                }
                full_path.extend(path.iter().cloned());
                let field = get_nested_value(&Value::entity(config.clone()), &full_path)?;
                self.resolve(&field).await
            }
            other => Err(RuntimeError::UnresolvedReference(format!(
                "{}.{}",
                other, name
            ))),
        }
    }
}
