// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scriptable tool server for integration tests and demos.
//!
//! Without `--script` every call succeeds with a plausible artifact for the
//! called tool. With `--script steps.json` each call consumes the next step:
//!
//! ```json
//! [
//!   {"action": "hang"},
//!   {"action": "respond", "artifacts": {"code": "fn main() {}"}, "progress": ["writing"]},
//!   {"action": "error", "code": -32000, "message": "model unavailable"},
//!   {"action": "crash", "code": 3},
//!   {"action": "malformed"}
//! ]
//! ```
//!
//! The last step repeats once the script runs out. `--state counter.txt`
//! persists the call counter so a respawned server continues the script.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use foreman::process::protocol::{
    decode, encode, Notification, Request, Response, METHOD_INITIALIZE, PROTOCOL_VERSION,
};

#[derive(Parser)]
#[command(name = "mock-tool-server", about = "Scriptable tool server for tests and demos")]
struct Args {
    /// Role label used in progress notifications
    #[arg(long, env = "FOREMAN_AGENT", default_value = "worker")]
    role: String,

    /// JSON array of steps, one consumed per call
    #[arg(long)]
    script: Option<PathBuf>,

    /// File holding the call counter across restarts
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Step {
    Respond {
        #[serde(default)]
        artifacts: Map<String, Value>,
        #[serde(default)]
        errors: Vec<String>,
        #[serde(default)]
        needs_research: bool,
        #[serde(default)]
        progress: Vec<String>,
        #[serde(default)]
        delay_ms: u64,
        /// Emit stderr chatter, a non-JSON stdout line and a log notification first.
        #[serde(default)]
        noise: bool,
    },
    Error {
        code: i64,
        message: String,
    },
    /// Never answer.
    Hang,
    /// Exit without answering.
    Crash {
        #[serde(default = "default_exit_code")]
        code: i32,
    },
    /// Answer with an id but neither result nor error.
    Malformed,
}

fn default_exit_code() -> i32 {
    1
}

struct Server {
    role: String,
    steps: Vec<Step>,
    state: Option<PathBuf>,
    calls: AtomicUsize,
    out: Mutex<Stdout>,
}

impl Server {
    /// Claim the step for the next call.
    fn next_step(&self) -> Option<Step> {
        let index = match self.state {
            Some(ref path) => {
                let count = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if let Err(e) = std::fs::write(path, (count + 1).to_string()) {
                    eprintln!("mock-tool-server: cannot persist counter: {}", e);
                }
                count
            }
            None => self.calls.fetch_add(1, Ordering::SeqCst),
        };
        self.steps.get(index).or_else(|| self.steps.last()).cloned()
    }

    async fn write_line(&self, line: &str) {
        let mut out = self.out.lock().await;
        let _ = out.write_all(line.as_bytes()).await;
        let _ = out.flush().await;
    }

    async fn send<T: serde::Serialize>(&self, msg: &T) {
        match encode(msg) {
            Ok(line) => self.write_line(&line).await,
            Err(e) => eprintln!("mock-tool-server: {}", e),
        }
    }

    async fn handle(&self, request: Request, step: Option<Step>) {
        let step = match step {
            Some(step) => step,
            None => {
                let result = default_result(&request);
                return self.send(&Response::success(request.id, result)).await;
            }
        };

        match step {
            Step::Respond {
                artifacts,
                errors,
                needs_research,
                progress,
                delay_ms,
                noise,
            } => {
                if noise {
                    eprintln!("mock-tool-server: warming up {}", self.role);
                    self.write_line("Loading model weights...\n").await;
                    self.send(&Notification::log("info", "cache warm")).await;
                }
                let total = progress.len();
                for (i, message) in progress.iter().enumerate() {
                    let pct = ((i + 1) * 100 / total) as f64;
                    self.send(&Notification::progress(&self.role, message, Some(pct)))
                        .await;
                }
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                let result = json!({
                    "artifacts": artifacts,
                    "errors": errors,
                    "needs_research": needs_research,
                });
                self.send(&Response::success(request.id, result)).await;
            }
            Step::Error { code, message } => {
                self.send(&Response::failure(request.id, code, message)).await;
            }
            Step::Hang => std::future::pending::<()>().await,
            Step::Crash { code } => {
                let _ = self.out.lock().await.flush().await;
                std::process::exit(code);
            }
            Step::Malformed => {
                self.write_line(&format!("{{\"id\":{}}}\n", request.id)).await;
            }
        }
    }
}

/// Unscripted answer for each tool.
fn default_result(request: &Request) -> Value {
    let instructions = request
        .params
        .get("instructions")
        .and_then(Value::as_str)
        .unwrap_or("");
    let artifacts = match request.method.as_str() {
        "research" => json!({ "research": { "summary": format!("Notes for: {}", instructions) } }),
        "design" => json!({ "design": format!("Design for: {}", instructions) }),
        "generate_code" => json!({ "code": format!("// Generated for: {}", instructions) }),
        "review" => json!({ "review": "No issues found" }),
        "request_approval" => json!({ "approval": { "approved": true } }),
        "respond" => json!({ "final_response": format!("Completed: {}", instructions) }),
        other => {
            let mut artifacts = Map::new();
            artifacts.insert(other.to_string(), json!("ok"));
            Value::Object(artifacts)
        }
    };
    json!({ "artifacts": artifacts, "errors": [], "needs_research": false })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let steps: Vec<Step> = match args.script {
        Some(ref path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    let server = Arc::new(Server {
        role: args.role,
        steps,
        state: args.state,
        calls: AtomicUsize::new(0),
        out: Mutex::new(tokio::io::stdout()),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let request: Request = match decode(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("mock-tool-server: ignoring input: {}", e);
                continue;
            }
        };

        if request.method == METHOD_INITIALIZE {
            let result = json!({
                "name": "mock-tool-server",
                "role": server.role,
                "protocol_version": PROTOCOL_VERSION,
            });
            server.send(&Response::success(request.id, result)).await;
            continue;
        }

        let step = server.next_step();
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.handle(request, step).await });
    }
    Ok(())
}
