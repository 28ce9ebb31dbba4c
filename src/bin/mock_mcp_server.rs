//! Fixture stdio server used by the integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and serves a single
//! example resource. On startup it prints a non-JSON banner to stdout — the
//! gateway's line filter must drop it — and a diagnostic line to stderr.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

fn main() {
    // Non-JSON noise the gateway is expected to filter out.
    println!("mock-mcp-server ready");
    eprintln!("mock-mcp-server: serving on stdio");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        // Notifications elicit no response.
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut response = json!({ "jsonrpc": "2.0", "id": id });
        match reply(method, request.get("params")) {
            Ok(result) => response["result"] = result,
            Err(error) => response["error"] = error,
        }

        if writeln!(stdout, "{response}").and_then(|()| stdout.flush()).is_err() {
            break;
        }
    }
}

fn reply(method: &str, params: Option<&Value>) -> Result<Value, Value> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "resources": { "subscribe": true },
            },
            "serverInfo": {
                "name": "example-server",
                "version": "1.0.0",
            },
        })),
        "resources/list" => Ok(json!({
            "resources": [
                {
                    "name": "Example Resource",
                    "uri": "file:///example.txt",
                },
            ],
        })),
        "resources/read" => {
            let uri = params
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
                .unwrap_or("file:///example.txt");
            if uri != "file:///example.txt" {
                return Err(json!({
                    "code": -32602,
                    "message": format!("Invalid params: unknown resource uri {uri}"),
                }));
            }
            Ok(json!({
                "contents": [
                    {
                        "uri": "file:///example.txt",
                        "mimeType": "text/plain",
                        "text": "This is the content of the example resource.",
                    },
                ],
            }))
        }
        "resources/templates/list" => Ok(json!({
            "resourceTemplates": [
                {
                    "name": "Example resource template",
                    "description": "Specify the filename to retrieve",
                    "uriTemplate": "file://{filename}",
                },
            ],
        })),
        "resources/subscribe" | "resources/unsubscribe" | "ping" => Ok(json!({})),
        other => Err(json!({
            "code": -32601,
            "message": format!("method {other} not found"),
        })),
    }
}
