use crate::context::ExecutionContext;
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use flowlang::{Entity, RuntimeError, RuntimeResult, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

impl Runtime {
    /// Run a `script` entity as a child process. `overrides` (input keys, tool-call
    /// arguments) are merged over the declared `params`.
    pub(crate) async fn run_script(
        &self,
        script: &Entity,
        ctx: &ExecutionContext,
        overrides: HashMap<String, Value>,
    ) -> RuntimeResult<Value> {
        let resolver = Resolver::new(self, ctx);
        let language = resolver
            .property_string(script, "language")
            .await?
            .ok_or_else(|| RuntimeError::missing(script.display_name(), "language"))?;

        let code = match resolver.property_string(script, "code").await? {
            Some(code) => code,
            None => {
                let path = resolver
                    .property_string(script, "file")
                    .await?
                    .ok_or_else(|| RuntimeError::missing(script.display_name(), "code"))?;
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| RuntimeError::Io(format!("Failed to read script {}: {}", path, e)))?
            }
        };

        let mut params: BTreeMap<String, Value> = BTreeMap::new();
        if let Some(Value::Object(declared)) = script.property("params") {
            for (key, value) in declared {
                let value = match value {
                    Value::TypedParameter { default: None, .. } => continue,
                    Value::TypedParameter {
                        default: Some(default),
                        ..
                    } => resolver.resolve(default).await?,
                    other => resolver.resolve(other).await?,
                };
                params.insert(key.clone(), value);
            }
        }
        if let Some(Value::Object(input)) = ctx.get_var("input") {
            params.extend(input);
        }
        params.extend(overrides);

        // Kept alive until the process exits.
        let mut _source_file = None;
        let mut command = match language.as_str() {
            "python" | "python3" => {
                let mut file = tempfile::Builder::new()
                    .prefix("flowrt-")
                    .suffix(".py")
                    .tempfile()?;
                file.write_all(code.as_bytes())?;
                file.flush()?;
                let mut command = Command::new("python3");
                command.arg(file.path());
                _source_file = Some(file);
                command
            }
            "bash" | "sh" => {
                let mut command = Command::new(&language);
                command.arg("-c").arg(&code);
                command
            }
            other => {
                return Err(RuntimeError::NotImplemented(format!(
                    "script language '{}'",
                    other
                )))
            }
        };

        let params_json = Value::Object(params.clone().into_iter().collect())
            .to_json()
            .to_string();
        for (key, value) in &params {
            command.env(
                format!("FLOW_PARAM_{}", key.to_uppercase()),
                value.to_display_string(),
            );
        }
        command
            .env("FLOW_PARAMS", params_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(script = %script.name(), language = %language, "running script");
        let output = ctx
            .with_deadline("script", async {
                command.output().await.map_err(RuntimeError::from)
            })
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(RuntimeError::RequestFailed(format!(
                "script '{}' exited with {}: {}",
                script.name(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(Value::String(format!("{}{}", stdout, stderr).trim().to_string()))
    }
}
