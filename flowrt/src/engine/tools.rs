//! Tool entities and the toolbox offered to an intent's model.

use crate::context::ExecutionContext;
use crate::provider::{ToolCall, ToolDefinition};
use crate::resolver::Resolver;
use crate::runtime::Runtime;
use flowlang::{Entity, EntityKind, RuntimeError, RuntimeResult, Value};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Replace `{{name}}` slots in a command template with call arguments.
///
/// Values are inserted verbatim with no shell quoting, so a tool whose arguments come
/// from a model can be made to run arbitrary commands.
pub fn substitute_arguments(template: &str, args: &JsonValue) -> String {
    let Some(map) = args.as_object() else {
        return template.to_string();
    };
    let mut text = template.to_string();
    for (name, value) in map {
        let replacement = match value {
            JsonValue::String(s) => s.clone(),
            other => Value::from_json(other).to_display_string(),
        };
        text = text
            .replace(&format!("{{{{{}}}}}", name), &replacement)
            .replace(&format!("{{{{ {} }}}}", name), &replacement);
    }
    text
}

/// Names a command template may use as argument slots: declared params and the keys
/// of the call's arguments.
fn argument_slots(tool: &Entity, args: &JsonValue) -> HashSet<String> {
    let mut slots: HashSet<String> = args
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    if let Some(Value::Object(params)) = tool.property("params") {
        slots.extend(params.keys().cloned());
    }
    slots
}

fn json_type(param_type: &str) -> &'static str {
    match param_type.to_ascii_lowercase().as_str() {
        "number" | "float" | "f64" => "number",
        "integer" | "int" | "i64" => "integer",
        "bool" | "boolean" => "boolean",
        "array" | "list" => "array",
        "object" | "map" => "object",
        _ => "string",
    }
}

/// JSON schema for a `params` object of typed parameters.
pub(crate) fn parameters_schema(params: Option<&Value>) -> JsonValue {
    let mut properties = Map::new();
    let mut required = Vec::new();
    if let Some(Value::Object(decls)) = params {
        let sorted: BTreeMap<&String, &Value> = decls.iter().collect();
        for (name, decl) in sorted {
            let schema = match decl {
                Value::TypedParameter {
                    param_type,
                    required: is_required,
                    description,
                    choices,
                    ..
                } => {
                    if *is_required {
                        required.push(JsonValue::String(name.clone()));
                    }
                    let mut schema = json!({ "type": json_type(param_type) });
                    if let Some(description) = description {
                        schema["description"] = json!(description);
                    }
                    if !choices.is_empty() {
                        schema["enum"] =
                            JsonValue::Array(choices.iter().map(Value::to_json).collect());
                    }
                    schema
                }
                other => json!({ "type": json_type(other.type_name()) }),
            };
            properties.insert(name.clone(), schema);
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

enum ToolSource {
    Local(Entity),
    Mcp { server: String },
}

/// Tools available to one intent, keyed by the name the model sees.
pub(crate) struct Toolbox {
    definitions: Vec<ToolDefinition>,
    sources: HashMap<String, ToolSource>,
}

impl Toolbox {
    pub(crate) async fn build(
        runtime: &Runtime,
        intent: &Entity,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<Self> {
        let mut toolbox = Self {
            definitions: Vec::new(),
            sources: HashMap::new(),
        };
        let entries: Vec<Value> = match intent.property("tools") {
            None => return Ok(toolbox),
            Some(Value::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
        };

        let resolver = Resolver::new(runtime, ctx);
        for entry in &entries {
            let entity = match resolver.resolve(entry).await? {
                Value::NestedEntity(entity) => *entity,
                Value::String(name) => runtime
                    .workspace()
                    .tool(&name)
                    .or_else(|| runtime.workspace().mcp_server(&name))
                    .cloned()
                    .ok_or_else(|| RuntimeError::not_found("tool", name))?,
                other => {
                    return Err(RuntimeError::TypeError(format!(
                        "tools entry must name a tool or mcp server, got {}",
                        other.type_name()
                    )))
                }
            };
            match entity.kind {
                EntityKind::Tool => {
                    let description = resolver
                        .property_string(&entity, "description")
                        .await?
                        .unwrap_or_default();
                    toolbox.definitions.push(ToolDefinition {
                        name: entity.name().to_string(),
                        description,
                        parameters: parameters_schema(entity.property("params")),
                    });
                    toolbox
                        .sources
                        .insert(entity.name().to_string(), ToolSource::Local(entity));
                }
                EntityKind::Mcp => {
                    let server = entity.name().to_string();
                    let client = ctx
                        .with_deadline("MCP connect", runtime.mcp_client(&server))
                        .await?;
                    let tools = ctx.with_deadline("tools/list", client.list_tools()).await?;
                    debug!(server = %server, count = tools.len(), "registered MCP tools");
                    for tool in tools {
                        toolbox.definitions.push(ToolDefinition {
                            name: tool.name.clone(),
                            description: tool.description.unwrap_or_default(),
                            parameters: tool.input_schema,
                        });
                        toolbox.sources.insert(
                            tool.name,
                            ToolSource::Mcp {
                                server: server.clone(),
                            },
                        );
                    }
                }
                other => {
                    return Err(RuntimeError::UnsupportedEntityType(format!(
                        "{} in tools list",
                        other
                    )))
                }
            }
        }
        Ok(toolbox)
    }

    pub(crate) fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub(crate) async fn invoke(
        &self,
        runtime: &Runtime,
        call: &ToolCall,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<String> {
        match self.sources.get(&call.name) {
            Some(ToolSource::Local(entity)) => runtime.run_tool(entity, ctx, &call.arguments).await,
            Some(ToolSource::Mcp { server }) => {
                let client = ctx
                    .with_deadline("MCP connect", runtime.mcp_client(server))
                    .await?;
                ctx.with_deadline(
                    "tools/call",
                    client.call_tool_text(&call.name, call.arguments.clone()),
                )
                .await
            }
            None => Err(RuntimeError::ToolExecutionFailed {
                tool: call.name.clone(),
                message: "tool is not available to this intent".to_string(),
            }),
        }
    }
}

impl Runtime {
    /// Execute a tool entity with JSON arguments, returning its text output.
    pub(crate) async fn run_tool(
        &self,
        tool: &Entity,
        ctx: &ExecutionContext,
        args: &JsonValue,
    ) -> RuntimeResult<String> {
        let args = if args.is_object() {
            args.clone()
        } else {
            json!({})
        };
        let resolver = Resolver::new(self, ctx);

        if let Some(command) = tool.property("command") {
            let template = match command {
                Value::String(raw) => raw.clone(),
                other => resolver.resolve_string(other).await?,
            };
            // Arguments go in last so their text is never evaluated as placeholders.
            let slots = argument_slots(tool, &args);
            let template = resolver.interpolate_keeping(&template, |expr| slots.contains(expr));
            let line = substitute_arguments(&template, &args);
            debug!(tool = %tool.name(), command = %line, "running tool command");
            return self.run_shell(tool.name(), &line, ctx).await;
        }

        if let Some(server) = tool.property("mcp") {
            let server = match resolver.resolve(server).await? {
                Value::NestedEntity(entity) => entity.name().to_string(),
                other => other.to_display_string(),
            };
            let remote_name = resolver
                .property_string(tool, "tool")
                .await?
                .unwrap_or_else(|| tool.name().to_string());
            let client = ctx
                .with_deadline("MCP connect", self.mcp_client(&server))
                .await?;
            return ctx
                .with_deadline("tools/call", client.call_tool_text(&remote_name, args))
                .await;
        }

        if let Some(script) = tool.property("script") {
            let script = match resolver.resolve(script).await? {
                Value::NestedEntity(entity) => *entity,
                other => {
                    let name = other.to_display_string();
                    self.workspace()
                        .script(&name)
                        .cloned()
                        .ok_or_else(|| RuntimeError::not_found("script", name))?
                }
            };
            let params = Value::from_json(&args)
                .as_object()
                .cloned()
                .unwrap_or_default();
            let output = self.run_script(&script, ctx, params).await?;
            return Ok(output.to_display_string());
        }

        Err(RuntimeError::missing(tool.display_name(), "command"))
    }

    async fn run_shell(
        &self,
        tool: &str,
        line: &str,
        ctx: &ExecutionContext,
    ) -> RuntimeResult<String> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = ctx
            .with_deadline("tool command", async {
                command.output().await.map_err(RuntimeError::from)
            })
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RuntimeError::ToolExecutionFailed {
                tool: tool.to_string(),
                message: if stderr.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use flowlang::Workspace;

    fn tool_runtime() -> (Runtime, ExecutionContext) {
        let config = RuntimeConfig::default();
        let ctx = ExecutionContext::new(config.timeout());
        (Runtime::new(Workspace::new(), config), ctx)
    }

    #[tokio::test]
    async fn argument_text_is_not_expanded() {
        std::env::set_var("FLOWRT_TOOLS_SECRET", "s3cr3t");
        let (rt, ctx) = tool_runtime();
        let tool = Entity::new(EntityKind::Tool, "echo")
            .with_property("command", Value::from("echo '{{x}}'"));
        let output = rt
            .run_tool(&tool, &ctx, &json!({"x": "{{env.FLOWRT_TOOLS_SECRET}}"}))
            .await
            .unwrap();
        assert_eq!(output, "{{env.FLOWRT_TOOLS_SECRET}}");
    }

    #[tokio::test]
    async fn template_placeholders_expand_around_argument_slots() {
        std::env::set_var("FLOWRT_TOOLS_GREETING", "hello");
        let (rt, ctx) = tool_runtime();
        ctx.set_var("x", Value::from("shadowed"));
        let tool = Entity::new(EntityKind::Tool, "greet").with_property(
            "command",
            Value::from("echo {{env.FLOWRT_TOOLS_GREETING}} {{ x }}"),
        );
        let output = rt.run_tool(&tool, &ctx, &json!({"x": "world"})).await.unwrap();
        assert_eq!(output, "hello world");
    }

    #[test]
    fn substitutes_both_spacings_without_escaping() {
        let args = json!({"path": "a b; rm -rf x", "n": 3});
        assert_eq!(
            substitute_arguments("ls {{path}} | head -{{ n }} {{other}}", &args),
            "ls a b; rm -rf x | head -3 {{other}}"
        );
        assert_eq!(substitute_arguments("echo {{x}}", &json!(null)), "echo {{x}}");
    }

    #[test]
    fn schema_marks_required_and_choices() {
        let params = Value::object([
            (
                "city",
                Value::TypedParameter {
                    param_type: "string".into(),
                    required: true,
                    default: None,
                    description: Some("City name".into()),
                    choices: vec![],
                },
            ),
            (
                "units",
                Value::TypedParameter {
                    param_type: "string".into(),
                    required: false,
                    default: Some(Box::new(Value::from("metric"))),
                    description: None,
                    choices: vec![Value::from("metric"), Value::from("imperial")],
                },
            ),
            (
                "days",
                Value::TypedParameter {
                    param_type: "int".into(),
                    required: false,
                    default: None,
                    description: None,
                    choices: vec![],
                },
            ),
        ]);
        let schema = parameters_schema(Some(&params));
        assert_eq!(schema["required"], json!(["city"]));
        assert_eq!(schema["properties"]["city"]["description"], "City name");
        assert_eq!(schema["properties"]["units"]["enum"], json!(["metric", "imperial"]));
        assert_eq!(schema["properties"]["days"]["type"], "integer");
    }

    #[test]
    fn schema_without_params_is_empty_object() {
        let schema = parameters_schema(None);
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].as_object().unwrap().is_empty());
    }
}
