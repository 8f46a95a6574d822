//! Demo tool provider — speaks line-delimited JSON-RPC on stdin/stdout.
//!
//! Tools:
//! - `echo {text}`: returns `text`
//! - `read_file {path}`: returns `"<label>:<path>"` without touching disk
//! - `sleep {ms}`: answers after `ms` milliseconds
//! - `fail {}`: returns a result flagged `isError`
//! - `crash {}`: exits the process with status 3
//! - `grow {}` (with `--dynamic`): adds a `grown` tool and announces
//!   `notifications/tools/list_changed`
//!
//! Each call is answered on its own task, so replies can come back out of
//! order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "demo-provider")]
#[command(about = "Demo stdio tool provider")]
struct Args {
    /// Label echoed by `read_file`
    #[arg(long, env = "DEMO_PROVIDER_LABEL", default_value = "demo")]
    label: String,

    /// Advertise tools in `initialize` and reject `tools/list`
    #[arg(long)]
    legacy: bool,

    /// Never answer `tools/list`
    #[arg(long)]
    hang_tools_list: bool,

    /// Offer `grow`, which changes the tool list at runtime
    #[arg(long)]
    dynamic: bool,
}

type SharedStdout = Arc<Mutex<Stdout>>;

/// Tool set, shared with the call tasks.
struct Tools {
    label: String,
    dynamic: bool,
    grown: AtomicBool,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let tools = Arc::new(Tools {
        label: args.label,
        dynamic: args.dynamic,
        grown: AtomicBool::new(false),
    });

    eprintln!("demo-provider '{}' ready", tools.label);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring malformed line");
            continue;
        };
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = request.get("id").cloned() else {
            // Notifications need no reply.
            continue;
        };

        match method.as_str() {
            "initialize" => {
                let mut result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "demo-provider", "version": env!("CARGO_PKG_VERSION")},
                });
                if args.legacy {
                    result["tools"] = tools.definitions();
                }
                reply(&stdout, id, Ok(result)).await?;
            }
            "tools/list" if args.hang_tools_list => {
                eprintln!("leaving tools/list unanswered");
            }
            "tools/list" if !args.legacy => {
                reply(&stdout, id, Ok(json!({"tools": tools.definitions()}))).await?;
            }
            "tools/call" => {
                let stdout = Arc::clone(&stdout);
                let tools = Arc::clone(&tools);
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                tokio::spawn(async move {
                    let outcome = call_tool(&tools, &stdout, &params).await;
                    if let Err(e) = reply(&stdout, id, outcome).await {
                        eprintln!("failed to write reply: {e}");
                    }
                });
            }
            other => {
                let error = json!({"code": -32601, "message": format!("method not found: {other}")});
                reply(&stdout, id, Err(error)).await?;
            }
        }
    }
    Ok(())
}

async fn reply(stdout: &SharedStdout, id: Value, outcome: Result<Value, Value>) -> std::io::Result<()> {
    let frame = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
    };
    write_frame(stdout, frame).await
}

async fn write_frame(stdout: &SharedStdout, frame: Value) -> std::io::Result<()> {
    let mut line = frame.to_string();
    line.push('\n');

    let mut out = stdout.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

async fn call_tool(tools: &Tools, stdout: &SharedStdout, params: &Value) -> Result<Value, Value> {
    let label = &tools.label;
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];

    match name {
        "echo" => Ok(text(args["text"].as_str().unwrap_or_default(), false)),
        "read_file" => Ok(text(
            &format!("{label}:{}", args["path"].as_str().unwrap_or_default()),
            false,
        )),
        "sleep" => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text(&format!("slept {ms}ms"), false))
        }
        "fail" => Ok(text("deliberate failure", true)),
        "crash" => {
            eprintln!("crashing on request");
            std::process::exit(3);
        }
        "grow" if tools.dynamic => {
            tools.grown.store(true, Ordering::SeqCst);
            let changed = json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"});
            write_frame(stdout, changed)
                .await
                .map_err(|e| json!({"code": -32603, "message": e.to_string()}))?;
            Ok(text("grew", false))
        }
        "grown" if tools.grown.load(Ordering::SeqCst) => Ok(text("new tool", false)),
        other => Err(json!({"code": -32602, "message": format!("unknown tool: {other}")})),
    }
}

fn text(body: &str, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": body}],
        "isError": is_error,
    })
}

impl Tools {
    fn definitions(&self) -> Value {
        let mut definitions = base_definitions();
        if let Some(list) = definitions.as_array_mut() {
            if self.dynamic {
                list.push(json!({
                    "name": "grow",
                    "description": "Add the grown tool",
                    "inputSchema": {"type": "object"}
                }));
            }
            if self.grown.load(Ordering::SeqCst) {
                list.push(json!({
                    "name": "grown",
                    "description": "Appears after grow",
                    "inputSchema": {"type": "object"}
                }));
            }
        }
        definitions
    }
}

fn base_definitions() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the given text",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to return"}},
                "required": ["text"]
            }
        },
        {
            "name": "read_file",
            "description": "Pretend to read a file",
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        },
        {
            "name": "sleep",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}, "tags": {"type": "array"}}
            }
        },
        {
            "name": "fail",
            "description": "Always reports an error",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "crash",
            "description": "Exit the provider process",
            "inputSchema": {"type": "object"}
        }
    ])
}
