#![forbid(unsafe_code)]

//! `toolpipe-stub-server`: scripted JSON-RPC peer for end-to-end tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and answers the
//! handshake, `ping`, `echo`, `request_id`, `list_operations`, `tools/list`
//! (two tools per page) and `tools/call`. The tools exercise edge cases of the client:
//!
//! | Tool       | Behavior                                                   |
//! |------------|------------------------------------------------------------|
//! | `echo`     | returns `arguments.text` (or the arguments as JSON)        |
//! | `add`      | returns `a + b`                                            |
//! | `delay`    | answers after `arguments.ms` milliseconds                  |
//! | `hang`     | never answers                                              |
//! | `exit`     | exits with `arguments.code` without answering              |
//! | `garbage`  | writes an undecodable line, then the answer                |
//! | `split`    | writes the answer in two chunks with a pause in between    |
//! | `notify`   | sends a server notification, then the answer               |
//! | `ask`      | sends a server request, then the answer                    |
//! | `fail`     | answers with `isError: true`                               |
//! | `env`      | returns the value of variable `arguments.name`             |
//! | `cwd`      | returns the working directory                              |
//!
//! Flags: `--silent-init` never answers `initialize`; `--reject-init`
//! answers it with an error; `--ignore-term` survives SIGTERM and stdin EOF.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Tools advertised by `tools/list`, in page order.
const TOOLS: &[(&str, &str)] = &[
    ("echo", "Echo the text argument"),
    ("add", "Add two numbers"),
    ("delay", "Answer after a delay"),
    ("hang", "Never answer"),
    ("exit", "Exit the server process"),
    ("garbage", "Emit an undecodable line before answering"),
    ("split", "Write the answer in two chunks"),
    ("notify", "Send a notification before answering"),
    ("ask", "Send a server request before answering"),
    ("fail", "Report a tool-level error"),
    ("env", "Read an environment variable"),
    ("cwd", "Report the working directory"),
];

const PAGE_SIZE: usize = 2;

/// Unit of work for the stdout writer task.
enum Output {
    /// One complete frame.
    Frame(Value),
    /// Raw bytes, each chunk preceded by a pause.
    Chunks(Vec<(Duration, Vec<u8>)>),
    /// Terminate the process once earlier output is flushed.
    Exit(i32),
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    silent_init: bool,
    reject_init: bool,
    ignore_term: bool,
}

impl Flags {
    fn from_args() -> Self {
        let mut flags = Self::default();
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--silent-init" => flags.silent_init = true,
                "--reject-init" => flags.reject_init = true,
                "--ignore-term" => flags.ignore_term = true,
                other => eprintln!("stub: ignoring unknown flag {other}"),
            }
        }
        flags
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let flags = Flags::from_args();
    eprintln!("stub: starting (pid {})", std::process::id());

    #[cfg(unix)]
    let _sigterm = if flags.ignore_term {
        // Installing a handler replaces the default terminate action.
        Some(tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )?)
    } else {
        None
    };

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_output(out_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => handle(message, flags, &out_tx),
            Err(err) => eprintln!("stub: undecodable input: {err}"),
        }
    }

    eprintln!("stub: stdin closed");
    if flags.ignore_term {
        std::future::pending::<()>().await;
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn write_output(mut rx: mpsc::UnboundedReceiver<Output>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = rx.recv().await {
        match output {
            Output::Frame(frame) => {
                let mut bytes = serde_json::to_vec(&frame)?;
                bytes.push(b'\n');
                stdout.write_all(&bytes).await?;
            }
            Output::Chunks(chunks) => {
                for (pause, bytes) in chunks {
                    tokio::time::sleep(pause).await;
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
            }
            Output::Exit(code) => {
                stdout.flush().await?;
                std::process::exit(code);
            }
        }
        stdout.flush().await?;
    }
    Ok(())
}

fn handle(message: Value, flags: Flags, out: &mpsc::UnboundedSender<Output>) {
    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let Some(id) = message.get("id").cloned() else {
        // Notifications need no answer.
        return;
    };

    match method {
        "initialize" if flags.silent_init => {}
        "initialize" if flags.reject_init => {
            send(out, error(&id, -32600, "initialization refused"));
        }
        "initialize" => {
            let version = params
                .get("protocolVersion")
                .cloned()
                .unwrap_or_else(|| json!("2024-11-05"));
            send(
                out,
                success(
                    &id,
                    json!({
                        "protocolVersion": version,
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": "toolpipe-stub-server",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                        "instructions": "Scripted peer for tests.",
                    }),
                ),
            );
        }
        "ping" => send(out, success(&id, json!({}))),
        "echo" => send(out, success(&id, params)),
        "request_id" => send(out, success(&id, json!({ "id": id }))),
        "list_operations" => {
            let names: Vec<&str> = TOOLS.iter().map(|(name, _)| *name).collect();
            send(out, success(&id, json!({ "operations": names })));
        }
        "tools/list" => send(out, success(&id, tools_page(&params))),
        "tools/call" => call_tool(id, &params, out),
        other => send(out, error(&id, -32601, &format!("method not found: {other}"))),
    }
}

fn tools_page(params: &Value) -> Value {
    let start = params
        .get("cursor")
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0)
        .min(TOOLS.len());
    let end = (start + PAGE_SIZE).min(TOOLS.len());

    let tools: Vec<Value> = TOOLS[start..end]
        .iter()
        .map(|(name, description)| {
            json!({
                "name": name,
                "description": description,
                "inputSchema": { "type": "object" },
            })
        })
        .collect();

    if end < TOOLS.len() {
        json!({ "tools": tools, "nextCursor": end.to_string() })
    } else {
        json!({ "tools": tools })
    }
}

fn call_tool(id: Value, params: &Value, out: &mpsc::UnboundedSender<Output>) {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .map_or_else(|| args.to_string(), str::to_owned);
            send(out, success(&id, text_result(&text)));
        }
        "add" => {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            send(out, success(&id, text_result(&(a + b).to_string())));
        }
        "delay" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                send(&out, success(&id, text_result(&format!("slept {ms}ms"))));
            });
        }
        "hang" => {}
        "exit" => {
            let code = args
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(0);
            let _ = out.send(Output::Exit(code));
        }
        "garbage" => {
            let _ = out.send(Output::Chunks(vec![(
                Duration::ZERO,
                b"this is not json\n".to_vec(),
            )]));
            send(out, success(&id, text_result("after garbage")));
        }
        "split" => {
            let mut bytes = serde_json::to_vec(&success(&id, text_result("reassembled")))
                .unwrap_or_default();
            bytes.push(b'\n');
            let tail = bytes.split_off(bytes.len() / 2);
            let _ = out.send(Output::Chunks(vec![
                (Duration::ZERO, bytes),
                (Duration::from_millis(50), tail),
            ]));
        }
        "notify" => {
            send(
                out,
                json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": { "level": "info", "data": "tool invoked" },
                }),
            );
            send(out, success(&id, text_result("notified")));
        }
        "ask" => {
            send(
                out,
                json!({
                    "jsonrpc": "2.0",
                    "id": "srv-1",
                    "method": "roots/list",
                }),
            );
            send(out, success(&id, text_result("asked")));
        }
        "fail" => {
            send(
                out,
                success(
                    &id,
                    json!({
                        "content": [{ "type": "text", "text": "tool failed" }],
                        "isError": true,
                    }),
                ),
            );
        }
        "env" => {
            let value = args
                .get("name")
                .and_then(Value::as_str)
                .and_then(|name| std::env::var(name).ok())
                .unwrap_or_else(|| "<unset>".to_owned());
            send(out, success(&id, text_result(&value)));
        }
        "cwd" => {
            let cwd = std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_default();
            send(out, success(&id, text_result(&cwd)));
        }
        other => send(out, error(&id, -32602, &format!("unknown tool: {other}"))),
    }
}

fn send(out: &mpsc::UnboundedSender<Output>, frame: Value) {
    let _ = out.send(Output::Frame(frame));
}

fn text_result(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": false })
}

fn success(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
