use flowrt::mcp::McpClient;
use flowrt::RuntimeError;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// In-process MCP server: answers each request line with one response line, in order.
/// A request for method `garbage` is answered with a line that is not JSON, `slow` is
/// answered after 100ms and `misnumbered` carries an id the client never sent.
async fn serve(stream: DuplexStream) {
    let (reader, mut writer) = split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: JsonValue = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => continue,
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request["method"].as_str().unwrap_or_default().to_string();
        if method == "slow" {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let reply = match method.as_str() {
            "garbage" => "this is not json".to_string(),
            "misnumbered" => {
                let wrong = id.as_u64().unwrap_or_default() + 100;
                json!({"jsonrpc": "2.0", "id": wrong, "result": {}}).to_string()
            }
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"protocolVersion": "2024-11-05", "capabilities": {"tools": {}}}
            })
            .to_string(),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [
                    {"name": "search", "description": "Search issues",
                     "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}},
                    {"name": "count", "inputSchema": {"type": "object"}}
                ]}
            })
            .to_string(),
            "tools/call" => {
                let query = request["params"]["arguments"]["q"].as_str().unwrap_or("");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [
                        {"type": "text", "text": format!("found {}", query)},
                        {"type": "text", "text": "done"}
                    ]}
                })
                .to_string()
            }
            "fail" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            })
            .to_string(),
            other => json!({"jsonrpc": "2.0", "id": id, "result": {"echo": other}}).to_string(),
        };
        if writer.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
            break;
        }
    }
}

fn connect() -> McpClient {
    let (client_side, server_side) = duplex(64 * 1024);
    tokio::spawn(serve(server_side));
    let (reader, writer) = split(client_side);
    McpClient::from_streams("test", reader, writer)
}

#[tokio::test]
async fn concurrent_requests_are_answered_in_order() {
    let client = Arc::new(connect());
    let calls = (0..8).map(|n| {
        let client = client.clone();
        async move {
            let method = format!("ping/{}", n);
            let result = client.request(&method, json!({})).await.unwrap();
            (method, result)
        }
    });
    for (method, result) in join_all(calls).await {
        assert_eq!(result, json!({ "echo": method }));
    }
}

#[tokio::test]
async fn handshake_and_tool_listing() {
    let client = connect();
    let init = client.initialize().await.unwrap();
    assert_eq!(init["protocolVersion"], "2024-11-05");

    let tools = client.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["search", "count"]);
    assert_eq!(tools[0].description.as_deref(), Some("Search issues"));
    assert_eq!(tools[1].description, None);
    assert_eq!(tools[0].input_schema["properties"]["q"]["type"], "string");
}

#[tokio::test]
async fn tool_call_text_joins_content_items() {
    let client = connect();
    let text = client
        .call_tool_text("search", json!({"q": "flaky tests"}))
        .await
        .unwrap();
    assert_eq!(text, "found flaky tests\ndone");
}

#[tokio::test]
async fn malformed_response_is_a_parse_error() {
    let client = connect();
    let err = client.request("garbage", json!({})).await.unwrap_err();
    assert!(matches!(err, RuntimeError::McpProtocol { code: -32700, .. }));

    // The channel stays usable for the next request.
    let next = client.request("after", json!({})).await.unwrap();
    assert_eq!(next, json!({"echo": "after"}));
}

#[tokio::test]
async fn remote_errors_carry_code_and_message() {
    let client = connect();
    let err = client.request("fail", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        RuntimeError::McpProtocol {
            code: -32601,
            message: "Method not found".to_string()
        }
    );
}

#[tokio::test]
async fn abandoned_request_does_not_shift_later_replies() {
    let client = connect();
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), client.request("slow", json!({}))).await;
    assert!(abandoned.is_err());
    assert!(!client.is_broken());

    // The late reply to "slow" is read and dropped before this one.
    let next = client.request("second", json!({})).await.unwrap();
    assert_eq!(next, json!({"echo": "second"}));
    let after = client.request("third", json!({})).await.unwrap();
    assert_eq!(after, json!({"echo": "third"}));
}

#[tokio::test]
async fn unexpected_response_id_is_a_protocol_error() {
    let client = connect();
    let err = client.request("misnumbered", json!({})).await.unwrap_err();
    assert!(matches!(err, RuntimeError::McpProtocol { code: -32700, .. }));
}
