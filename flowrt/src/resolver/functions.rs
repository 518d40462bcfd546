//! Built-in function table.
//!
//! Functions are pure except `write_file` and `print`, which act on the host.

use crate::context::ExecutionContext;
use flowlang::{RuntimeError, RuntimeResult, Value};
use std::path::PathBuf;
use tracing::debug;

/// Call a built-in with already-resolved arguments.
pub(crate) async fn call_function(
    ctx: &ExecutionContext,
    name: &str,
    args: Vec<Value>,
) -> RuntimeResult<Value> {
    match name {
        "env" => {
            let var = arg_string(name, &args, 0)?;
            let fallback = args.get(1).map(Value::to_display_string).unwrap_or_default();
            Ok(Value::String(std::env::var(&var).unwrap_or(fallback)))
        }
        "file" => {
            let pattern = arg_string(name, &args, 0)?;
            if pattern.contains(['*', '?', '[']) {
                glob_files(&pattern).await
            } else {
                read_file(&pattern).await.map(Value::String)
            }
        }
        "read_file" => read_file(&arg_string(name, &args, 0)?)
            .await
            .map(Value::String),
        "write_file" => {
            let path = arg_string(name, &args, 0)?;
            let content = arg_string(name, &args, 1)?;
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| RuntimeError::Io(format!("Failed to write {}: {}", path, e)))?;
            debug!(path = %path, "write_file");
            Ok(Value::String(path))
        }
        "print" => {
            let line = join_display(&args, " ");
            println!("{}", line);
            Ok(Value::String(line))
        }
        "concat" => {
            if !args.is_empty() && args.iter().all(|a| matches!(a, Value::Array(_))) {
                let items = args
                    .into_iter()
                    .flat_map(|a| match a {
                        Value::Array(items) => items,
                        _ => Vec::new(),
                    })
                    .collect();
                Ok(Value::Array(items))
            } else {
                Ok(Value::String(join_display(&args, "")))
            }
        }
        "len" => match args.as_slice() {
            [Value::String(s)] => Ok(Value::Number(s.chars().count() as f64)),
            [Value::Array(items)] => Ok(Value::Number(items.len() as f64)),
            [Value::Object(map)] => Ok(Value::Number(map.len() as f64)),
            [other] => Err(RuntimeError::TypeError(format!(
                "len() expects a string, array or object, got {}",
                other.type_name()
            ))),
            _ => Err(arity(name, 1, args.len())),
        },
        "step" => {
            let step = arg_string(name, &args, 0)?;
            let output = ctx
                .step_record(&step)
                .ok_or_else(|| RuntimeError::UnresolvedReference(format!("step.{}", step)))?;
            let tokens = ctx
                .step_record(&format!("{}.tokens", step))
                .unwrap_or_else(|| Value::Object(Default::default()));
            Ok(Value::object([("output", output), ("tokens", tokens)]))
        }
        other => Err(RuntimeError::UnresolvedReference(format!(
            "unknown function '{}'",
            other
        ))),
    }
}

fn arity(name: &str, expected: usize, got: usize) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "{}() expects {} argument(s), got {}",
        name, expected, got
    ))
}

fn arg_string(name: &str, args: &[Value], index: usize) -> RuntimeResult<String> {
    args.get(index)
        .map(Value::to_display_string)
        .ok_or_else(|| arity(name, index + 1, args.len()))
}

fn join_display(args: &[Value], separator: &str) -> String {
    args.iter()
        .map(Value::to_display_string)
        .collect::<Vec<_>>()
        .join(separator)
}

async fn read_file(path: &str) -> RuntimeResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RuntimeError::Io(format!("Failed to read {}: {}", path, e)))
}

/// Sorted `{path, content}` objects; unreadable matches are skipped.
async fn glob_files(pattern: &str) -> RuntimeResult<Value> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| RuntimeError::TypeError(format!("invalid glob '{}': {}", pattern, e)))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => files.push(Value::object([
                ("path", Value::String(path.display().to_string())),
                ("content", Value::String(content)),
            ])),
            Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable file"),
        }
    }
    Ok(Value::Array(files))
}
