use flowrt::{
    Entity, EntityKind, ExecuteOptions, Runtime, RuntimeConfig, RuntimeError, Value, Workspace,
};
use pretty_assertions::assert_eq;

fn runtime(entities: Vec<Entity>) -> Runtime {
    Runtime::new(Workspace::from_entities(entities), RuntimeConfig::default())
}

fn bash(name: &str, code: &str) -> Entity {
    Entity::new(EntityKind::Script, name)
        .with_property("language", Value::from("bash"))
        .with_property("code", Value::from(code))
}

#[tokio::test]
async fn script_params_arrive_as_environment_variables() {
    let script = bash("greet", r#"echo "$FLOW_PARAM_GREETING $FLOW_PARAM_NAME""#).with_property(
        "params",
        Value::object([
            (
                "greeting",
                Value::TypedParameter {
                    param_type: "string".to_string(),
                    required: false,
                    default: Some(Box::new(Value::from("hello"))),
                    description: None,
                    choices: vec![],
                },
            ),
            ("name", Value::from("world")),
        ]),
    );
    let rt = runtime(vec![script.clone()]);

    let defaults = rt.execute(&script, ExecuteOptions::default()).await.unwrap();
    assert_eq!(defaults.output, Value::from("hello world"));

    let input = Value::object([("name", Value::from("bob"))]);
    let overridden = rt
        .execute(&script, ExecuteOptions::with_input(input))
        .await
        .unwrap();
    assert_eq!(overridden.output, Value::from("hello bob"));
}

#[tokio::test]
async fn script_sees_all_params_as_json() {
    let script = bash("dump", r#"printf '%s' "$FLOW_PARAMS""#)
        .with_property("params", Value::object([("n", Value::Number(3.0))]));
    let rt = runtime(vec![script.clone()]);

    let result = rt.execute(&script, ExecuteOptions::default()).await.unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&result.output.to_display_string()).unwrap();
    assert_eq!(parsed, serde_json::json!({"n": 3.0}));
}

#[tokio::test]
async fn non_zero_exit_fails_with_stderr() {
    let script = bash("boom", "echo 'disk full' >&2; exit 2");
    let rt = runtime(vec![script.clone()]);

    let failure = rt
        .execute(&script, ExecuteOptions::default())
        .await
        .unwrap_err();
    match failure.error {
        RuntimeError::RequestFailed(message) => assert!(message.contains("disk full")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unknown_script_language_is_not_implemented() {
    let script = Entity::new(EntityKind::Script, "ruby")
        .with_property("language", Value::from("ruby"))
        .with_property("code", Value::from("puts 1"));
    let rt = runtime(vec![script.clone()]);

    let failure = rt
        .execute(&script, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, RuntimeError::NotImplemented(_)));
}

#[tokio::test]
async fn command_tools_substitute_arguments() {
    let tool = Entity::new(EntityKind::Tool, "say")
        .with_property("command", Value::from("echo {{ word }}-{{count}}"));
    let rt = runtime(vec![tool.clone()]);

    let input = Value::object([("word", Value::from("hi")), ("count", Value::Number(2.0))]);
    let result = rt
        .execute(&tool, ExecuteOptions::with_input(input))
        .await
        .unwrap();
    assert_eq!(result.output, Value::from("hi-2"));
}

#[tokio::test]
async fn script_tools_delegate_to_the_script() {
    let script = bash("upper", r#"echo "$FLOW_PARAM_TEXT" | tr a-z A-Z"#);
    let tool = Entity::new(EntityKind::Tool, "shout")
        .with_property("script", Value::reference("script", "upper"));
    let rt = runtime(vec![script, tool.clone()]);

    let input = Value::object([("text", Value::from("quiet"))]);
    let result = rt
        .execute(&tool, ExecuteOptions::with_input(input))
        .await
        .unwrap();
    assert_eq!(result.output, Value::from("QUIET"));
}

#[tokio::test]
async fn mcp_tools_spawn_their_server_once() {
    // Answers every request that carries an id; notifications get no reply.
    let server_script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong %s"}]}}\n' "$id" "$id"
  fi
done
"#;
    let server = Entity::new(EntityKind::Mcp, "pinger")
        .with_property("command", Value::from("sh"))
        .with_property(
            "args",
            Value::Array(vec![Value::from("-c"), Value::from(server_script)]),
        );
    let tool = Entity::new(EntityKind::Tool, "ping")
        .with_property("mcp", Value::from("pinger"))
        .with_property("tool", Value::from("ping"));
    let rt = runtime(vec![server, tool.clone()]);

    let first = rt.execute(&tool, ExecuteOptions::default()).await.unwrap();
    let second = rt.execute(&tool, ExecuteOptions::default()).await.unwrap();
    // id 1 is the handshake; the tool calls follow on the same connection.
    assert_eq!(first.output, Value::from("pong 2"));
    assert_eq!(second.output, Value::from("pong 3"));
    assert_eq!(rt.mcp().names().await, vec!["pinger".to_string()]);

    rt.shutdown().await;
}
