use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::connectors::{MailboxApi, TokenEndpoint};
use crate::error::IngestError;
use crate::mcp::tools::{self, ToolContext};

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Serves requests line by line until stdin closes. Requests run one at a time.
pub async fn run_stdio_server<A, T>(ctx: &ToolContext<A, T>) -> Result<()>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await.context("read tool server stdin line")? {
        if line.trim().is_empty() {
            continue;
        }

        if let Some(response_line) = handle_request_line(ctx, &line).await {
            stdout
                .write_all(format!("{response_line}\n").as_bytes())
                .await
                .context("write tool server response")?;
            stdout.flush().await.context("flush tool server response")?;
        }
    }

    Ok(())
}

async fn handle_request_line<A, T>(ctx: &ToolContext<A, T>, line: &str) -> Option<String>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(error) => {
            return Some(
                jsonrpc_error(None, -32700, "Parse error", Some(error.to_string())).to_string(),
            );
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        return Some(
            jsonrpc_error(
                request.id,
                -32600,
                "Invalid Request",
                Some("jsonrpc must be \"2.0\"".to_string()),
            )
            .to_string(),
        );
    }

    let id = request.id.clone();
    let response = match request.method.as_str() {
        "initialize" => jsonrpc_result(
            id,
            json!({
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": {}
                }
            }),
        ),
        "tools/list" => jsonrpc_result(
            id,
            json!({
                "tools": tools::tool_schemas()
            }),
        ),
        "tools/call" => {
            let Some(tool_name) = request.params.get("name").and_then(Value::as_str) else {
                return Some(
                    jsonrpc_error(
                        id,
                        -32602,
                        "Invalid params",
                        Some("tools/call requires params.name".to_string()),
                    )
                    .to_string(),
                );
            };

            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            match tools::call_tool(ctx, tool_name, arguments).await {
                Ok(result) => jsonrpc_result(id, result),
                Err(error) => match error.downcast_ref::<IngestError>() {
                    Some(IngestError::Validation(reason)) => {
                        jsonrpc_error(id, -32602, "Invalid params", Some(reason.clone()))
                    }
                    _ => jsonrpc_error(
                        id,
                        -32000,
                        "Tool execution failed",
                        Some(format!("{error:#}")),
                    ),
                },
            }
        }
        _ => jsonrpc_error(
            id,
            -32601,
            "Method not found",
            Some(format!("Unknown method '{}'", request.method)),
        ),
    };

    if response.get("id").is_some_and(Value::is_null) && request.id.is_none() {
        return None;
    }

    Some(response.to_string())
}

fn jsonrpc_result(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.unwrap_or(Value::Null),
        "result": result
    })
}

fn jsonrpc_error(id: Option<Value>, code: i64, message: &str, data: Option<String>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = Value::String(data);
    }

    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.unwrap_or(Value::Null),
        "error": error
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::handle_request_line;
    use crate::mcp::tools::tests::{seeded_context, temp_db_path};

    fn parse_response(line: &str) -> Value {
        serde_json::from_str(line).expect("parse response JSON")
    }

    #[tokio::test]
    async fn initialize_returns_server_info_and_capabilities() {
        let path = temp_db_path();
        let (ctx, _, _) = seeded_context(&path);

        let request = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
        let response = parse_response(&handle_request_line(&ctx, request).await.expect("response"));
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["serverInfo"]["name"], "mailroom");
        assert!(response["result"]["capabilities"]["tools"].is_object());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn tools_call_returns_stats() {
        let path = temp_db_path();
        let (ctx, user_id, _) = seeded_context(&path);

        let request = format!(
            r#"{{"jsonrpc":"2.0","id":"s1","method":"tools/call","params":{{"name":"mail_stats","arguments":{{"user_id":{user_id}}}}}}}"#
        );
        let response = parse_response(&handle_request_line(&ctx, &request).await.expect("response"));
        assert_eq!(response["id"], "s1");
        assert_eq!(response["result"]["total_emails"], 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn blank_search_maps_to_invalid_params() {
        let path = temp_db_path();
        let (ctx, user_id, _) = seeded_context(&path);

        let request = format!(
            r#"{{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{{"name":"mail_search","arguments":{{"user_id":{user_id},"query":"  "}}}}}}"#
        );
        let response = parse_response(&handle_request_line(&ctx, &request).await.expect("response"));
        assert_eq!(response["error"]["code"], -32602);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn remote_failure_is_tool_execution_error() {
        let path = temp_db_path();
        let (ctx, user_id, _) = seeded_context(&path);

        let request = format!(
            r#"{{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{{"name":"mail_fetch","arguments":{{"user_id":{user_id}}}}}}}"#
        );
        let response = parse_response(&handle_request_line(&ctx, &request).await.expect("response"));
        assert_eq!(response["error"]["code"], -32000);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn invalid_json_returns_parse_error() {
        let path = temp_db_path();
        let (ctx, _, _) = seeded_context(&path);

        let response = parse_response(&handle_request_line(&ctx, "{").await.expect("response"));
        assert_eq!(response["error"]["code"], -32700);

        let _ = std::fs::remove_file(path);
    }
}
