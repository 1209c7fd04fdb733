// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stream server.
//!
//! Accepts client connections, owns the session registry and bridges each
//! session's event bus onto the client's connection. A session runs one
//! workflow with its own process pool; it survives client disconnects so a
//! client can re-attach with `init{session_id}` and drain buffered events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedConfig;
use crate::events::{EventBus, ProgressEvent};
use crate::process::{ProcessManager, ProtocolError, RestartPolicy, WorkerInvoker, WorkerSpec};
use crate::types::{AgentId, Mode};
use crate::workflow::{StateSnapshot, Supervisor, WorkflowDriver, WorkflowState};

use super::error::{StreamError, StreamResult};
use super::protocol::{decode_client, encode, ClientMessage, ServerMessage};
use super::transport::{self, ClientStream, Listener, StreamIo};

/// Messages buffered per connection before event forwarding waits.
const OUTBOUND_BUFFER: usize = 256;

/// What the writer task sends to the client. Bus events stay events until
/// written so they can go back on the bus if the client disappears.
enum Outbound {
    Message(ServerMessage),
    Event(ProgressEvent),
}

impl Outbound {
    fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            Self::Message(msg) => encode(msg),
            Self::Event(event) => encode(&ServerMessage::from_event(event)),
        }
    }

    fn into_event(self) -> Option<ProgressEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Message(_) => None,
        }
    }
}

// ============================================================================
// Worker pools
// ============================================================================

/// Builds the worker invoker for a new session.
pub trait InvokerFactory: Send + Sync {
    fn create(&self, workspace: &Path, bus: EventBus, cancel: watch::Receiver<bool>) -> Arc<dyn WorkerInvoker>;
}

/// One [`ProcessManager`] per session.
pub struct ProcessPool {
    specs: std::collections::BTreeMap<AgentId, WorkerSpec>,
    policy: RestartPolicy,
}

impl ProcessPool {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            specs: config.worker_specs(),
            policy: config.restart_policy(),
        }
    }
}

impl InvokerFactory for ProcessPool {
    fn create(&self, workspace: &Path, bus: EventBus, cancel: watch::Receiver<bool>) -> Arc<dyn WorkerInvoker> {
        Arc::new(
            ProcessManager::new(bus, workspace, self.specs.clone())
                .with_policy(self.policy.clone())
                .with_cancel(cancel),
        )
    }
}

// ============================================================================
// Sessions
// ============================================================================

enum Phase {
    Idle,
    Running(StateSnapshot),
    Finished,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running(_) => "running",
            Self::Finished => "finished",
        }
    }
}

struct Session {
    id: String,
    workspace: PathBuf,
    bus: EventBus,
    cancel: watch::Sender<bool>,
    phase: StdMutex<Phase>,
    attached: AtomicBool,
}

impl Session {
    fn new(workspace: PathBuf, capacity: usize) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (cancel, _) = watch::channel(false);
        Self {
            bus: EventBus::new(id.clone(), capacity),
            id,
            workspace,
            cancel,
            phase: StdMutex::new(Phase::Idle),
            attached: AtomicBool::new(false),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type Registry = RwLock<HashMap<String, Arc<Session>>>;

struct Shared {
    config: ResolvedConfig,
    factory: StdMutex<Arc<dyn InvokerFactory>>,
    sessions: Registry,
}

impl Shared {
    fn factory(&self) -> Arc<dyn InvokerFactory> {
        let factory = self.factory.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&factory)
    }

    /// Let another client attach. Idle sessions are discarded, running ones keep buffering.
    async fn release(&self, session: &Session) {
        session.attached.store(false, Ordering::SeqCst);
        let idle = matches!(*session.phase(), Phase::Idle);
        if idle {
            self.sessions.write().await.remove(&session.id);
            debug!(session = %session.id, "Idle session discarded");
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct StreamServer {
    socket_path: PathBuf,
    listener: Option<Listener>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl StreamServer {
    pub fn new(socket_path: impl AsRef<Path>, config: ResolvedConfig) -> Self {
        let factory: Arc<dyn InvokerFactory> = Arc::new(ProcessPool::from_config(&config));
        let (shutdown, _) = watch::channel(false);
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            shared: Arc::new(Shared {
                config,
                factory: StdMutex::new(factory),
                sessions: RwLock::new(HashMap::new()),
            }),
            shutdown,
        }
    }

    /// Replace how sessions get their workers. Applies to every workflow
    /// started afterwards, on new and already open connections.
    pub fn with_invoker_factory(self, factory: Arc<dyn InvokerFactory>) -> Self {
        *self
            .shared
            .factory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = factory;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn start(&mut self) -> StreamResult<()> {
        let listener = transport::bind(&self.socket_path)
            .map_err(|e| StreamError::BindFailed(format!("{}: {}", self.socket_path.display(), e)))?;
        info!("Stream server listening on {:?}", self.socket_path);
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept clients until [`StreamServer::stop`] is called.
    pub async fn run(&self) -> StreamResult<()> {
        let listener = self.listener.as_ref().ok_or(StreamError::NotStarted)?;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        debug!("Client connection accepted");
                        self.serve(stream);
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        return Err(StreamError::AcceptFailed(e.to_string()));
                    }
                },
                _ = wait_for_true(&mut shutdown) => break,
            }
        }
        Ok(())
    }

    /// Serve one client on any byte stream.
    pub fn serve(&self, stream: impl StreamIo + 'static) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(serve_connection(shared, Box::new(stream), shutdown))
    }

    /// Stop accepting, cancel every running session and remove the socket.
    pub async fn stop(&mut self) -> StreamResult<()> {
        self.shutdown.send_replace(true);
        for session in self.shared.sessions.read().await.values() {
            session.cancel.send_replace(true);
        }
        self.listener = None;
        transport::cleanup(&self.socket_path)
            .map_err(|e| StreamError::from_io_error("cleaning up socket", e))?;
        info!("Stream server stopped");
        Ok(())
    }

    /// Ids of live sessions.
    pub async fn session_ids(&self) -> Vec<String> {
        self.shared.sessions.read().await.keys().cloned().collect()
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if self.listener.is_some() {
            let _ = transport::cleanup(&self.socket_path);
        }
    }
}

// ============================================================================
// Connections
// ============================================================================

async fn serve_connection(shared: Arc<Shared>, stream: ClientStream, mut shutdown: watch::Receiver<bool>) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (out, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_messages(write_half, out_rx));

    let mut conn = Connection {
        shared,
        out,
        session: None,
        forwarder: None,
    };
    conn.send(ServerMessage::Connected {
        version: crate::VERSION.to_string(),
    })
    .await;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            _ = wait_for_true(&mut shutdown) => break,
        };
        match read {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => match decode_client(&line) {
                Ok(msg) => conn.handle(msg).await,
                Err(e) => {
                    warn!("Invalid client message: {}", e);
                    conn.send(ServerMessage::error("invalid_message", e.to_string()))
                        .await;
                }
            },
            Err(e) => {
                warn!("Error reading from client: {}", e);
                break;
            }
        }
    }

    conn.stop_forwarding().await;
    let session = conn.session.take();
    let shared = Arc::clone(&conn.shared);
    drop(conn);

    let undelivered = writer.await.unwrap_or_default();
    if let Some(session) = session {
        if !undelivered.is_empty() {
            debug!(
                session = %session.id,
                count = undelivered.len(),
                "Requeueing undelivered events"
            );
            session.bus.requeue_front(undelivered);
        }
        shared.release(&session).await;
    }
}

/// Write until the channel closes. Returns the events that never reached
/// the client, in order.
async fn write_messages(
    mut writer: WriteHalf<ClientStream>,
    mut rx: mpsc::Receiver<Outbound>,
) -> Vec<ProgressEvent> {
    while let Some(item) = rx.recv().await {
        let line = match item.encode() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode server message: {}", e);
                continue;
            }
        };
        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("Client write failed: {}", e);
            return collect_undelivered(item, rx).await;
        }
    }
    Vec::new()
}

async fn collect_undelivered(
    failed: Outbound,
    mut rx: mpsc::Receiver<Outbound>,
) -> Vec<ProgressEvent> {
    rx.close();
    let mut events: Vec<ProgressEvent> = failed.into_event().into_iter().collect();
    // Waits for the forwarder to drop its reserved slot.
    while let Some(item) = rx.recv().await {
        events.extend(item.into_event());
    }
    events
}

/// Move bus events onto the connection. A slot is reserved before an event
/// is taken off the bus, so aborting the task never loses one.
async fn forward_events(bus: EventBus, out: mpsc::Sender<Outbound>) {
    loop {
        let Ok(permit) = out.reserve().await else {
            break;
        };
        let Some(event) = bus.next().await else {
            break;
        };
        permit.send(Outbound::Event(event));
    }
}

struct Connection {
    shared: Arc<Shared>,
    out: mpsc::Sender<Outbound>,
    session: Option<Arc<Session>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.out.send(Outbound::Message(msg)).await;
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Init {
                workspace_path,
                session_id,
            } => self.init(workspace_path, session_id).await,
            ClientMessage::Chat { content, mode } => self.chat(content, mode).await,
            ClientMessage::Cancel => self.cancel().await,
            ClientMessage::Status => self.status().await,
        }
    }

    async fn init(&mut self, workspace_path: String, session_id: Option<String>) {
        if let Some(id) = session_id {
            let existing = self.shared.sessions.read().await.get(&id).cloned();
            return match existing {
                Some(session) => self.attach(session, true).await,
                None => {
                    self.send(ServerMessage::error(
                        "session_not_found",
                        format!("No live session {}", id),
                    ))
                    .await
                }
            };
        }

        let workspace = PathBuf::from(&workspace_path);
        if !workspace.is_dir() {
            self.send(ServerMessage::error(
                "invalid_workspace",
                format!("Not a directory: {}", workspace_path),
            ))
            .await;
            return;
        }
        self.open_session(workspace).await;
    }

    async fn open_session(&mut self, workspace: PathBuf) {
        let session = Arc::new(Session::new(workspace, self.shared.config.event_capacity));
        self.shared
            .sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session = %session.id, workspace = %session.workspace.display(), "Session opened");
        self.attach(session, false).await;
    }

    async fn attach(&mut self, session: Arc<Session>, resumed: bool) {
        if self.session.as_ref().is_some_and(|s| s.id == session.id) {
            self.send(initialized(&session, resumed)).await;
            return;
        }
        if session.attached.swap(true, Ordering::SeqCst) {
            self.send(ServerMessage::error(
                "session_attached",
                format!("Session {} already has a client", session.id),
            ))
            .await;
            return;
        }
        self.detach().await;

        if resumed {
            info!(session = %session.id, buffered = session.bus.len(), "Client re-attached");
        }
        self.send(initialized(&session, resumed)).await;

        self.forwarder = Some(tokio::spawn(forward_events(session.bus.clone(), self.out.clone())));
        self.session = Some(session);
    }

    /// Abort the forwarder and wait until it has let go of its channel slot.
    async fn stop_forwarding(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }

    /// Stop forwarding and release the session. Events already on the
    /// connection are still written.
    async fn detach(&mut self) {
        self.stop_forwarding().await;
        if let Some(session) = self.session.take() {
            self.shared.release(&session).await;
        }
    }

    async fn chat(&mut self, content: String, mode: Option<Mode>) {
        let Some(session) = self.session.clone() else {
            self.send(ServerMessage::error("not_initialized", "Send init before chat"))
                .await;
            return;
        };

        let phase = session.phase().as_str();
        let session = match phase {
            "running" => {
                self.send(ServerMessage::error(
                    "session_busy",
                    "A workflow is already running in this session",
                ))
                .await;
                return;
            }
            "finished" => {
                self.open_session(session.workspace.clone()).await;
                match self.session.clone() {
                    Some(session) => session,
                    None => return,
                }
            }
            _ => session,
        };

        let mode = mode.unwrap_or_else(|| Mode::infer(&content));
        let driver = self.build_driver(&session, content, mode);
        *session.phase() = Phase::Running(driver.subscribe());
        self.send(ServerMessage::status(
            "started",
            Some(serde_json::json!({ "session_id": session.id, "mode": mode })),
        ))
        .await;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_session(shared, session, driver));
    }

    fn build_driver(&self, session: &Session, query: String, mode: Mode) -> WorkflowDriver {
        let config = &self.shared.config;
        let invoker = self.shared.factory().create(
            &session.workspace,
            session.bus.clone(),
            session.cancel.subscribe(),
        );
        let state = WorkflowState::new(
            session.id.clone(),
            mode,
            query,
            session.workspace.display().to_string(),
        );
        WorkflowDriver::new(
            Supervisor::new(config.supervisor_policy()),
            invoker,
            session.bus.clone(),
            state,
        )
        .with_cancel(session.cancel.subscribe())
        .with_session_timeout(config.session_timeout())
    }

    async fn cancel(&self) {
        let running = self
            .session
            .as_ref()
            .filter(|session| matches!(*session.phase(), Phase::Running(_)));
        match running {
            Some(session) => {
                info!(session = %session.id, "Cancel requested");
                session.cancel.send_replace(true);
                self.send(ServerMessage::status("cancelling", None)).await;
            }
            None => {
                self.send(ServerMessage::error("no_active_workflow", "Nothing to cancel"))
                    .await
            }
        }
    }

    async fn status(&self) {
        let msg = match self.session {
            None => ServerMessage::status("disconnected", None),
            Some(ref session) => {
                let phase = session.phase();
                let detail = match *phase {
                    Phase::Running(ref snapshot) => serde_json::to_value(snapshot.get()).ok(),
                    _ => None,
                };
                ServerMessage::status(phase.as_str(), detail)
            }
        };
        self.send(msg).await;
    }
}

fn initialized(session: &Session, resumed: bool) -> ServerMessage {
    ServerMessage::Initialized {
        session_id: session.id.clone(),
        workspace_path: session.workspace.display().to_string(),
        resumed,
    }
}

async fn run_session(shared: Arc<Shared>, session: Arc<Session>, mut driver: WorkflowDriver) {
    let outcome = driver.run().await;
    *session.phase() = Phase::Finished;
    shared.sessions.write().await.remove(&session.id);
    info!(
        session = %session.id,
        termination = %outcome.termination,
        "Session finished"
    );
}

/// Resolve when the flag turns true. A dropped sender never resolves.
async fn wait_for_true(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::process::CallResult;
    use crate::types::{WorkerInput, WorkerOutput};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, DuplexStream, Lines};

    /// Answers instantly, or holds every call until cancelled.
    struct Scripted {
        hold: bool,
        cancel: watch::Receiver<bool>,
    }

    #[async_trait]
    impl WorkerInvoker for Scripted {
        async fn invoke(&self, agent: AgentId, _input: WorkerInput) -> CallResult {
            if self.hold {
                let mut cancel = self.cancel.clone();
                wait_for_true(&mut cancel).await;
            }
            let output = match agent {
                AgentId::Respond => WorkerOutput::with_artifact("final_response", "Here you go."),
                other => WorkerOutput::with_artifact(other.as_str(), "x"),
            };
            CallResult::success(agent, 1, output, Duration::from_millis(1))
        }
    }

    struct ScriptedFactory {
        hold: bool,
    }

    impl InvokerFactory for ScriptedFactory {
        fn create(&self, _workspace: &Path, _bus: EventBus, cancel: watch::Receiver<bool>) -> Arc<dyn WorkerInvoker> {
            Arc::new(Scripted {
                hold: self.hold,
                cancel,
            })
        }
    }

    struct Client {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, json: &str) {
            self.writer.write_all(json.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> ServerMessage {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("server went quiet")
                .unwrap()
                .expect("server closed the connection");
            serde_json::from_str(&line).unwrap()
        }

        async fn recv_until_result(&mut self) -> (Vec<ServerMessage>, ServerMessage) {
            let mut seen = Vec::new();
            loop {
                let msg = self.recv().await;
                if msg.is_final() {
                    return (seen, msg);
                }
                seen.push(msg);
            }
        }
    }

    fn server(hold: bool) -> StreamServer {
        StreamServer::new("/tmp/unused.sock", default_config())
            .with_invoker_factory(Arc::new(ScriptedFactory { hold }))
    }

    fn connect(server: &StreamServer) -> Client {
        connect_with_buffer(server, 64 * 1024)
    }

    fn connect_with_buffer(server: &StreamServer, buffer: usize) -> Client {
        let (client, server_side) = tokio::io::duplex(buffer);
        server.serve(server_side);
        let (read, writer) = tokio::io::split(client);
        Client {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    fn init_line(dir: &Path) -> String {
        serde_json::json!({"type": "init", "workspace_path": dir}).to_string()
    }

    #[tokio::test]
    async fn test_full_session_streams_to_result() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(false);
        let mut client = connect(&server);

        assert!(matches!(client.recv().await, ServerMessage::Connected { .. }));
        client.send(&init_line(dir.path())).await;
        let session_id = match client.recv().await {
            ServerMessage::Initialized { session_id, resumed, .. } => {
                assert!(!resumed);
                session_id
            }
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(server.session_ids().await, vec![session_id]);

        client
            .send(r#"{"type":"chat","content":"explain the parser","mode":"explain"}"#)
            .await;
        let (seen, result) = client.recv_until_result().await;

        let decisions: Vec<String> = seen
            .iter()
            .filter_map(|m| match m {
                ServerMessage::SupervisorEvent { decision, .. } => Some(decision.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(decisions, vec!["research", "respond", "END"]);
        match result {
            ServerMessage::Result { final_response, degraded, .. } => {
                assert_eq!(final_response, "Here you go.");
                assert!(!degraded);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_before_init_is_rejected() {
        let server = server(false);
        let mut client = connect(&server);
        client.recv().await;

        client.send(r#"{"type":"chat","content":"hi"}"#).await;
        assert!(matches!(
            client.recv().await,
            ServerMessage::Error { ref code, .. } if code == "not_initialized"
        ));

        client.send("not json").await;
        assert!(matches!(
            client.recv().await,
            ServerMessage::Error { ref code, .. } if code == "invalid_message"
        ));
    }

    #[tokio::test]
    async fn test_invalid_workspace() {
        let server = server(false);
        let mut client = connect(&server);
        client.recv().await;

        client
            .send(r#"{"type":"init","workspace_path":"/definitely/not/here"}"#)
            .await;
        assert!(matches!(
            client.recv().await,
            ServerMessage::Error { ref code, .. } if code == "invalid_workspace"
        ));
    }

    #[tokio::test]
    async fn test_cancel_ends_with_degraded_result() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(true);
        let mut client = connect(&server);
        client.recv().await;
        client.send(&init_line(dir.path())).await;
        client.recv().await;

        client.send(r#"{"type":"chat","content":"build a todo app"}"#).await;
        loop {
            if let ServerMessage::AgentEvent { agent, .. } = client.recv().await {
                if agent == "design" {
                    break;
                }
            }
        }
        client.send(r#"{"type":"cancel"}"#).await;

        let (_, result) = client.recv_until_result().await;
        match result {
            ServerMessage::Result { termination, degraded, .. } => {
                assert_eq!(termination, "cancelled");
                assert!(degraded);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_drains_buffered_events() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(true);

        let mut first = connect(&server);
        first.recv().await;
        first.send(&init_line(dir.path())).await;
        let session_id = match first.recv().await {
            ServerMessage::Initialized { session_id, .. } => session_id,
            other => panic!("unexpected: {:?}", other),
        };
        first.send(r#"{"type":"chat","content":"build a todo app"}"#).await;
        assert!(matches!(first.recv().await, ServerMessage::Status { .. }));
        drop(first);

        // The running session outlives its client.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.session_ids().await, vec![session_id.clone()]);

        let mut second = connect(&server);
        second.recv().await;
        second
            .send(&serde_json::json!({"type": "init", "workspace_path": dir.path(), "session_id": session_id}).to_string())
            .await;
        assert!(matches!(
            second.recv().await,
            ServerMessage::Initialized { resumed: true, .. }
        ));

        second.send(r#"{"type":"status"}"#).await;
        second.send(r#"{"type":"cancel"}"#).await;
        let (seen, result) = second.recv_until_result().await;
        assert!(seen.iter().any(|m| matches!(m, ServerMessage::Status { status, .. } if status == "running")));
        assert!(result.is_final());
    }

    #[tokio::test]
    async fn test_events_stuck_on_dead_connection_are_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(true);

        // Never reads, so the writer stalls on a nearly full pipe.
        let mut first = connect_with_buffer(&server, 16);
        first.send(&init_line(dir.path())).await;
        first
            .send(r#"{"type":"chat","content":"build a todo app","mode":"create"}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let session_id = server.session_ids().await.pop().unwrap();
        let mut second = connect(&server);
        second.recv().await;
        second
            .send(&serde_json::json!({"type": "init", "workspace_path": dir.path(), "session_id": session_id}).to_string())
            .await;
        assert!(matches!(
            second.recv().await,
            ServerMessage::Initialized { resumed: true, .. }
        ));
        second.send(r#"{"type":"cancel"}"#).await;

        let (seen, result) = second.recv_until_result().await;
        let decisions: Vec<&str> = seen
            .iter()
            .filter_map(|m| match m {
                ServerMessage::SupervisorEvent { decision, .. } => Some(decision.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(decisions.first(), Some(&"design"));
        assert!(seen
            .iter()
            .any(|m| matches!(m, ServerMessage::AgentEvent { agent, .. } if agent == "design")));
        assert!(matches!(result, ServerMessage::Result { degraded: true, .. }));
    }

    #[tokio::test]
    async fn test_factory_replaced_after_connections_exist() {
        let dir = tempfile::tempdir().unwrap();
        let server = StreamServer::new("/tmp/unused.sock", default_config());
        let mut client = connect(&server);
        let _server = server.with_invoker_factory(Arc::new(ScriptedFactory { hold: false }));

        client.recv().await;
        client.send(&init_line(dir.path())).await;
        client.recv().await;
        client
            .send(r#"{"type":"chat","content":"explain the parser","mode":"explain"}"#)
            .await;

        let (_, result) = client.recv_until_result().await;
        match result {
            ServerMessage::Result { final_response, degraded, .. } => {
                assert_eq!(final_response, "Here you go.");
                assert!(!degraded);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_id() {
        let server = server(false);
        let mut client = connect(&server);
        client.recv().await;
        client
            .send(r#"{"type":"init","workspace_path":"/tmp","session_id":"nope"}"#)
            .await;
        assert!(matches!(
            client.recv().await,
            ServerMessage::Error { ref code, .. } if code == "session_not_found"
        ));
    }

    #[tokio::test]
    async fn test_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.sock");
        let mut server = StreamServer::new(&path, default_config());
        assert!(matches!(server.run().await, Err(StreamError::NotStarted)));

        server.start().await.unwrap();
        #[cfg(unix)]
        assert!(path.exists());

        server.stop().await.unwrap();
        #[cfg(unix)]
        assert!(!path.exists());
    }
}
