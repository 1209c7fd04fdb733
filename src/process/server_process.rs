// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One live tool-server subprocess.
//!
//! The process's stdout is consumed by a dedicated read-loop task that owns
//! the correlation map outright. Callers never touch the map: they register a
//! pending call over a command channel before writing the request, and
//! abandon it (on timeout or cancellation) the same way. Every entry is
//! retired exactly once: by its response, by abandonment, or by the crash
//! drain when stdout closes.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::events::{EventBus, EventPayload};
use crate::types::AgentId;

use super::protocol::{self, Incoming, Request};
use super::types::{CallFailure, CallRequest, WorkerSpec};

type Reply = oneshot::Sender<Result<Value, CallFailure>>;

enum LoopCommand {
    Register { id: u64, reply: Reply },
    Abandon { id: u64 },
}

/// Result of retiring a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retirement {
    Retired,
    AlreadyRetired,
    Unknown,
}

/// Correlation map for one process. Only the read loop holds one.
///
/// Ids are issued in increasing order from 1, so any id at or below the
/// highest registered one that is no longer pending has been retired.
#[derive(Default)]
pub(crate) struct PendingCalls {
    pending: HashMap<u64, Reply>,
    highest: u64,
}

impl PendingCalls {
    pub(crate) fn register(&mut self, id: u64, reply: Reply) {
        self.highest = self.highest.max(id);
        self.pending.insert(id, reply);
    }

    /// Remove `id` and deliver `outcome` to its caller if it is still waiting.
    pub(crate) fn retire(&mut self, id: u64, outcome: Result<Value, CallFailure>) -> Retirement {
        match self.pending.remove(&id) {
            Some(reply) => {
                // The caller may have stopped listening; the entry is retired either way.
                let _ = reply.send(outcome);
                Retirement::Retired
            }
            None if (1..=self.highest).contains(&id) => Retirement::AlreadyRetired,
            None => Retirement::Unknown,
        }
    }

    /// Retire every pending call with the same failure. Returns how many.
    pub(crate) fn retire_all(&mut self, failure: &CallFailure) -> usize {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for id in &ids {
            self.retire(*id, Err(failure.clone()));
        }
        ids.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Abandons a registered call when dropped before its reply arrived.
struct PendingGuard<'a> {
    id: u64,
    commands: &'a mpsc::UnboundedSender<LoopCommand>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(LoopCommand::Abandon { id: self.id });
        }
    }
}

/// A spawned tool server and its read loop.
pub struct ToolServerProcess {
    agent: AgentId,
    pid: Option<u32>,
    child: Arc<Mutex<Child>>,
    stdin: Mutex<ChildStdin>,
    commands: mpsc::UnboundedSender<LoopCommand>,
    alive: Arc<AtomicBool>,
    exit_reason: Arc<std::sync::Mutex<Option<String>>>,
    next_id: AtomicU64,
}

impl ToolServerProcess {
    /// Spawn the subprocess and start its read loop.
    pub fn spawn(
        agent: AgentId,
        spec: &WorkerSpec,
        workspace: &Path,
        bus: EventBus,
    ) -> Result<Self, CallFailure> {
        let cwd = spec.cwd.as_deref().unwrap_or(workspace);
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .env("FOREMAN_AGENT", agent.as_str())
            .env("FOREMAN_SESSION_ID", bus.session_id())
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CallFailure::SpawnFailed(format!("{}: {}", spec.command, e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(CallFailure::SpawnFailed("stdio pipes unavailable".to_string()));
            }
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(agent, stderr, bus.clone()));
        }

        let pid = child.id();
        info!(agent = %agent, pid, command = %spec.command, "Spawned tool server");

        let child = Arc::new(Mutex::new(child));
        let alive = Arc::new(AtomicBool::new(true));
        let exit_reason = Arc::new(std::sync::Mutex::new(None));
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(
            ReadLoop {
                agent,
                bus,
                pending: PendingCalls::default(),
                child: Arc::clone(&child),
                alive: Arc::clone(&alive),
                exit_reason: Arc::clone(&exit_reason),
            }
            .run(stdout, command_rx),
        );

        Ok(Self {
            agent,
            pid,
            child,
            stdin: Mutex::new(stdin),
            commands,
            alive,
            exit_reason,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once stdout has closed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Why the process went away, once it has.
    pub fn exit_reason(&self) -> Option<String> {
        self.exit_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Allocate a correlation id and build the request for one call.
    pub fn prepare(&self, method: &str, arguments: Value, timeout: Duration) -> CallRequest {
        CallRequest {
            correlation_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            agent: self.agent,
            method: method.to_string(),
            arguments,
            timeout,
        }
    }

    /// Send a prepared request and wait for its terminal response, at most
    /// `request.timeout`.
    ///
    /// Dropping the returned future abandons the call cleanly.
    pub async fn send(&self, request: &CallRequest) -> Result<Value, CallFailure> {
        let id = request.correlation_id;
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(LoopCommand::Register { id, reply })
            .map_err(|_| self.crashed("read loop has stopped"))?;
        let mut guard = PendingGuard {
            id,
            commands: &self.commands,
            armed: true,
        };

        let line = protocol::encode(&Request::new(id, request.method.as_str(), request.arguments.clone()))
            .map_err(|e| CallFailure::MalformedMessage(e.to_string()))?;
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = write_line(&mut stdin, &line).await {
                warn!(agent = %self.agent, id, error = %e, "Failed to write request");
                return Err(self.crashed(&format!("write failed: {}", e)));
            }
        }
        trace!(agent = %self.agent, id, method = %request.method, "Request sent");

        match tokio::time::timeout(request.timeout, reply_rx).await {
            Ok(Ok(outcome)) => {
                guard.armed = false;
                outcome
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(self.crashed("read loop dropped the call"))
            }
            Err(_) => {
                debug!(agent = %self.agent, id, timeout = ?request.timeout, "Call timed out");
                Err(CallFailure::Timeout(request.timeout))
            }
        }
    }

    fn crashed(&self, fallback: &str) -> CallFailure {
        CallFailure::ProcessCrashed(self.exit_reason().unwrap_or_else(|| fallback.to_string()))
    }

    /// SIGTERM, wait up to `grace`, then kill.
    pub async fn terminate(&self, grace: Duration) {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(agent = %self.agent, pid, error = %e, "SIGTERM failed");
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => debug!(agent = %self.agent, "Tool server exited after SIGTERM"),
            Err(_) => {
                warn!(agent = %self.agent, ?grace, "Tool server ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Kill immediately without a grace period.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        self.alive.store(false, Ordering::SeqCst);
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

// ============================================================================
// Read Loop
// ============================================================================

struct ReadLoop {
    agent: AgentId,
    bus: EventBus,
    pending: PendingCalls,
    child: Arc<Mutex<Child>>,
    alive: Arc<AtomicBool>,
    exit_reason: Arc<std::sync::Mutex<Option<String>>>,
}

impl ReadLoop {
    async fn run(mut self, stdout: ChildStdout, mut commands: mpsc::UnboundedReceiver<LoopCommand>) {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            tokio::select! {
                // Registrations always precede the request write, so taking
                // commands first means a response never beats its registration.
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Owner dropped; kill_on_drop takes care of the child.
                    None => return,
                },
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        // read_until keeps partial bytes when a command wins the
                        // select, so only clear after a complete line.
                        self.handle_line(&String::from_utf8_lossy(&buf));
                        buf.clear();
                    }
                    Err(e) => {
                        warn!(agent = %self.agent, error = %e, "Read from tool server failed");
                        break;
                    }
                },
            }
        }

        let reason = self.exit_description().await;
        self.alive.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.exit_reason.lock() {
            *slot = Some(reason.clone());
        }

        let failure = CallFailure::ProcessCrashed(reason.clone());
        let drained = self.pending.retire_all(&failure);
        warn!(agent = %self.agent, reason = %reason, drained, "Tool server output closed");

        // Late callers get an immediate answer instead of hanging.
        while let Some(command) = commands.recv().await {
            if let LoopCommand::Register { id, reply } = command {
                self.pending.register(id, reply);
                self.pending.retire(id, Err(failure.clone()));
            }
        }
    }

    fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Register { id, reply } => self.pending.register(id, reply),
            LoopCommand::Abandon { id } => {
                if self.pending.retire(id, Err(CallFailure::Cancelled)) == Retirement::AlreadyRetired {
                    trace!(agent = %self.agent, id, "Abandon after retirement ignored");
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match protocol::parse_line(line) {
            Ok(Incoming::Response { id, outcome }) => {
                let outcome = outcome.map_err(|e| CallFailure::WorkerError {
                    code: e.code,
                    message: e.message,
                });
                self.retire(id, outcome);
            }
            Ok(Incoming::MalformedResponse { id, reason }) => {
                warn!(agent = %self.agent, id, reason = %reason, "Malformed response");
                self.retire(id, Err(CallFailure::MalformedMessage(reason)));
            }
            Ok(Incoming::Progress(params)) => {
                self.bus.publish(
                    self.agent.as_str(),
                    EventPayload::progress(params.message, params.pct),
                );
            }
            Ok(Incoming::Log(params)) => {
                self.bus
                    .publish(self.agent.as_str(), EventPayload::log(params.level, params.message));
            }
            Ok(Incoming::Unrecognized(snippet)) => {
                debug!(agent = %self.agent, message = %snippet, "Dropping unrecognized message");
            }
            Err(e) => {
                warn!(agent = %self.agent, error = %e, "Dropping unparseable line");
            }
        }
    }

    fn retire(&mut self, id: u64, outcome: Result<Value, CallFailure>) {
        match self.pending.retire(id, outcome) {
            Retirement::Retired => trace!(agent = %self.agent, id, "Call retired"),
            Retirement::AlreadyRetired => {
                debug!(agent = %self.agent, id, "Late response for retired call discarded")
            }
            Retirement::Unknown => warn!(agent = %self.agent, id, "Response for unknown call id"),
        }
    }

    async fn exit_description(&self) -> String {
        let mut child = self.child.lock().await;
        // stdout can close a moment before the process is reaped.
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => tokio::time::timeout(Duration::from_millis(200), child.wait())
                .await
                .ok()
                .and_then(Result::ok),
        };
        match status {
            Some(status) => match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            },
            None => "stdout closed".to_string(),
        }
    }
}

async fn forward_stderr(agent: AgentId, stderr: ChildStderr, bus: EventBus) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                trace!(agent = %agent, "stderr: {}", line);
                bus.publish(agent.as_str(), EventPayload::log("stderr", line));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(agent = %agent, error = %e, "stderr forwarding stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_retire_exactly_once() {
        let mut pending = PendingCalls::default();
        let (tx, mut rx) = oneshot::channel();
        pending.register(1, tx);

        assert_eq!(pending.retire(1, Ok(Value::Null)), Retirement::Retired);
        assert_eq!(
            pending.retire(1, Err(CallFailure::Cancelled)),
            Retirement::AlreadyRetired
        );
        assert_eq!(pending.retire(9, Ok(Value::Null)), Retirement::Unknown);
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
    }

    #[test]
    fn test_retired_ids_are_not_kept() {
        let mut pending = PendingCalls::default();
        for id in 1..=10_000 {
            let (tx, _rx) = oneshot::channel();
            pending.register(id, tx);
            assert_eq!(pending.retire(id, Err(CallFailure::Cancelled)), Retirement::Retired);
        }
        assert_eq!(pending.len(), 0);
        assert!(pending.pending.capacity() < 64);

        assert_eq!(pending.retire(1, Ok(Value::Null)), Retirement::AlreadyRetired);
        assert_eq!(pending.retire(10_000, Ok(Value::Null)), Retirement::AlreadyRetired);
        assert_eq!(pending.retire(0, Ok(Value::Null)), Retirement::Unknown);
        assert_eq!(pending.retire(10_001, Ok(Value::Null)), Retirement::Unknown);
    }

    #[test]
    fn test_retire_all_drains() {
        let mut pending = PendingCalls::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.register(1, tx1);
        pending.register(2, tx2);

        let failure = CallFailure::ProcessCrashed("exit code 1".to_string());
        assert_eq!(pending.retire_all(&failure), 2);
        assert_eq!(pending.len(), 0);
        assert_eq!(rx1.try_recv().unwrap(), Err(failure.clone()));
        assert_eq!(rx2.try_recv().unwrap(), Err(failure));
        assert_eq!(pending.retire_all(&CallFailure::Cancelled), 0);
    }

    #[test]
    fn test_retire_with_dropped_receiver() {
        let mut pending = PendingCalls::default();
        let (tx, rx) = oneshot::channel();
        pending.register(1, tx);
        drop(rx);
        assert_eq!(pending.retire(1, Ok(Value::Null)), Retirement::Retired);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_call_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = WorkerSpec::new("/definitely/not/a/tool-server");
        let result = ToolServerProcess::spawn(
            AgentId::Code,
            &spec,
            temp.path(),
            EventBus::new("s", 8),
        );
        assert!(matches!(result, Err(CallFailure::SpawnFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_drains_pending_call() {
        let temp = tempfile::TempDir::new().unwrap();
        // Reads one request, then exits without answering.
        let spec = WorkerSpec::new("sh").with_args(["-c", "read line; exit 3"]);
        let process =
            ToolServerProcess::spawn(AgentId::Code, &spec, temp.path(), EventBus::new("s", 8))
                .unwrap();

        let request = process.prepare("generate_code", Value::Null, Duration::from_secs(5));
        assert_eq!(request.correlation_id, 1);
        let outcome = process.send(&request).await;
        assert!(matches!(outcome, Err(CallFailure::ProcessCrashed(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!process.is_alive());
        let again = process
            .send(&process.prepare("generate_code", Value::Null, Duration::from_secs(5)))
            .await;
        assert!(matches!(again, Err(CallFailure::ProcessCrashed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_and_noise_forwarded() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = r#"read line; echo "booting" >&2; echo "not json"; echo '{"method":"$/progress","params":{"message":"half","pct":50}}'; echo '{"id":1,"result":{"artifacts":{"k":1}}}'; sleep 1"#;
        let spec = WorkerSpec::new("sh").with_args(["-c", script]);
        let bus = EventBus::new("s", 8);
        let process =
            ToolServerProcess::spawn(AgentId::Design, &spec, temp.path(), bus.clone()).unwrap();

        let outcome = process
            .send(&process.prepare("design", Value::Null, Duration::from_secs(5)))
            .await;
        assert_eq!(outcome.unwrap()["artifacts"]["k"], 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = bus.drain();
        assert!(events
            .iter()
            .any(|e| e.payload == EventPayload::progress("half", Some(50.0))));
        assert!(events
            .iter()
            .any(|e| e.payload == EventPayload::log("stderr", "booting")));
        process.terminate(Duration::from_millis(500)).await;
        assert!(!process.is_alive());
    }
}
