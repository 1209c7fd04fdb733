// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process Manager: one tool-server per worker role, behind a uniform call.
//!
//! Each role has a slot guarded by a FIFO-fair async mutex that is held for
//! the whole call, so a tool server never sees two requests at once and queued
//! callers are served in arrival order.
//!
//! Slot lifecycle:
//! - first call spawns the process and runs the `initialize` handshake
//! - a timeout retires the call but keeps the process; consecutive timeouts
//!   mark it UNHEALTHY
//! - an exit retires every pending call with `process_crashed` and marks it
//!   CRASHED
//! - the next call to an UNHEALTHY or CRASHED role respawns it after an
//!   exponential backoff; once the attempts are used up the role fails fast
//!   with `worker_unavailable`

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventBus, EventPayload};
use crate::telemetry::CallSpan;
use crate::types::{AgentId, WorkerInput, WorkerOutput};

use super::protocol::{METHOD_INITIALIZE, PROTOCOL_VERSION};
use super::server_process::ToolServerProcess;
use super::types::{CallFailure, CallResult, Health, RestartPolicy, WorkerSpec};

/// The call contract the workflow driver depends on.
///
/// [`ProcessManager`] is the production implementation; tests substitute
/// scripted invokers.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    /// Run one call against `agent`. Never fails: failures come back inside
    /// the [`CallResult`].
    async fn invoke(&self, agent: AgentId, input: WorkerInput) -> CallResult;

    /// Release any resources held for the session.
    async fn shutdown(&self) {}
}

/// Point-in-time view of one role's slot.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub agent: AgentId,
    /// `None` until the first call.
    pub health: Option<Health>,
    pub pid: Option<u32>,
    /// Respawns since the last successful call.
    pub restart_count: u32,
    /// Respawns over the session.
    pub total_restarts: u32,
    pub consecutive_timeouts: u32,
    /// Attempts exhausted; calls fail fast.
    pub unavailable: bool,
}

#[derive(Default)]
struct WorkerSlot {
    process: Option<ToolServerProcess>,
    health: Option<Health>,
    restart_count: u32,
    total_restarts: u32,
    consecutive_timeouts: u32,
    exhausted: bool,
}

/// Owns the tool-server processes of one session.
pub struct ProcessManager {
    session_id: String,
    workspace: PathBuf,
    specs: BTreeMap<AgentId, WorkerSpec>,
    policy: RestartPolicy,
    bus: EventBus,
    slots: HashMap<AgentId, Mutex<WorkerSlot>>,
    cancel: watch::Receiver<bool>,
    closing: watch::Sender<bool>,
}

impl ProcessManager {
    /// Create a manager for the roles in `specs`. Nothing is spawned yet.
    pub fn new(
        bus: EventBus,
        workspace: impl Into<PathBuf>,
        specs: BTreeMap<AgentId, WorkerSpec>,
    ) -> Self {
        let slots = specs
            .keys()
            .map(|agent| (*agent, Mutex::new(WorkerSlot::default())))
            .collect();
        // A receiver whose sender is gone never reports cancellation.
        let (_, cancel) = watch::channel(false);
        let (closing, _) = watch::channel(false);

        Self {
            session_id: bus.session_id().to_string(),
            workspace: workspace.into(),
            specs,
            policy: RestartPolicy::default(),
            bus,
            slots,
            cancel,
            closing,
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Tie in-flight and queued calls to a session cancellation flag.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Configured call timeout for `agent`.
    pub fn timeout_for(&self, agent: AgentId) -> Duration {
        self.specs
            .get(&agent)
            .map(|spec| spec.timeout)
            .unwrap_or_else(|| agent.default_timeout())
    }

    /// Snapshot one role's slot. Waits behind an in-flight call.
    pub async fn status(&self, agent: AgentId) -> Option<WorkerStatus> {
        let slot = self.slots.get(&agent)?.lock().await;
        Some(WorkerStatus {
            agent,
            health: slot.health,
            pid: slot.process.as_ref().and_then(ToolServerProcess::pid),
            restart_count: slot.restart_count,
            total_restarts: slot.total_restarts,
            consecutive_timeouts: slot.consecutive_timeouts,
            unavailable: slot.exhausted,
        })
    }

    /// Call `agent`'s tool server and wait at most `timeout` for its answer.
    ///
    /// The budget starts once the call reaches the head of the worker's queue
    /// and covers respawn backoff and handshake as well as the call itself.
    /// A startup in progress is not interrupted, so a call can only overrun
    /// `timeout` when backoff plus handshake alone exceed it; it then fails
    /// with a timeout without being sent.
    #[instrument(skip_all, fields(session = %self.session_id, agent = %agent))]
    pub async fn call(&self, agent: AgentId, input: WorkerInput, timeout: Duration) -> CallResult {
        let start = Instant::now();
        let Some(slot) = self.slots.get(&agent) else {
            let failure = CallFailure::WorkerUnavailable(format!("no tool server configured for {}", agent));
            return CallResult::failure(agent, 0, failure, start.elapsed());
        };

        // FIFO queue for the slot; queued callers leave on cancellation.
        let mut slot = tokio::select! {
            guard = slot.lock() => guard,
            _ = self.cancelled() => {
                return CallResult::failure(agent, 0, CallFailure::Cancelled, start.elapsed());
            }
        };
        if self.is_cancelled() {
            return CallResult::failure(agent, 0, CallFailure::Cancelled, start.elapsed());
        }
        let dequeued = Instant::now();

        if let Err(failure) = self.ensure_ready(agent, &mut slot).await {
            return CallResult::failure(agent, 0, failure, start.elapsed());
        }
        let Some(process) = slot.process.as_ref() else {
            let failure = CallFailure::WorkerUnavailable("tool server missing after start".to_string());
            return CallResult::failure(agent, 0, failure, start.elapsed());
        };

        let remaining = timeout.saturating_sub(dequeued.elapsed());
        if remaining.is_zero() {
            warn!(agent = %agent, ?timeout, "Tool server startup used the whole call budget");
            return CallResult::failure(agent, 0, CallFailure::Timeout(timeout), start.elapsed());
        }

        let request = process.prepare(agent.tool_name(), input.to_params(), remaining);
        let correlation_id = request.correlation_id;
        let span = CallSpan::start(agent.as_str(), correlation_id);
        let outcome = tokio::select! {
            outcome = process.send(&request) => outcome,
            _ = self.cancelled() => Err(CallFailure::Cancelled),
        };
        let outcome = outcome
            .map_err(|failure| match failure {
                CallFailure::Timeout(_) => CallFailure::Timeout(timeout),
                other => other,
            })
            .and_then(|value| {
                serde_json::from_value::<WorkerOutput>(value)
                    .map_err(|e| CallFailure::MalformedMessage(format!("invalid worker output: {}", e)))
            });
        span.finish(outcome.as_ref().err().map(CallFailure::code));

        self.observe_outcome(agent, &mut slot, &outcome);

        let duration = start.elapsed();
        match outcome {
            Ok(output) => CallResult::success(agent, correlation_id, output, duration),
            Err(failure) => {
                debug!(correlation_id, code = failure.code(), error = %failure, "Call failed");
                CallResult::failure(agent, correlation_id, failure, duration)
            }
        }
    }

    /// Update slot health from a call outcome.
    fn observe_outcome(
        &self,
        agent: AgentId,
        slot: &mut WorkerSlot,
        outcome: &Result<WorkerOutput, CallFailure>,
    ) {
        match outcome {
            Ok(_) => {
                slot.consecutive_timeouts = 0;
                slot.restart_count = 0;
            }
            Err(CallFailure::Timeout(_)) => {
                slot.consecutive_timeouts += 1;
                warn!(
                    agent = %agent,
                    consecutive = slot.consecutive_timeouts,
                    "Tool server call timed out"
                );
                if slot.consecutive_timeouts >= self.policy.unhealthy_after_timeouts
                    && slot.health == Some(Health::Ready)
                {
                    self.set_health(agent, slot, Health::Unhealthy);
                }
            }
            Err(CallFailure::ProcessCrashed(reason)) => {
                warn!(agent = %agent, reason = %reason, "Tool server crashed during call");
                self.set_health(agent, slot, Health::Crashed);
            }
            Err(CallFailure::Cancelled) => {}
            // The process answered, even if badly.
            Err(_) => slot.consecutive_timeouts = 0,
        }
    }

    /// Make sure the slot holds a READY process, spawning or respawning as needed.
    async fn ensure_ready(
        &self,
        agent: AgentId,
        slot: &mut MutexGuard<'_, WorkerSlot>,
    ) -> Result<(), CallFailure> {
        if slot.exhausted {
            return Err(self.unavailable(agent));
        }

        let alive = slot.process.as_ref().map(ToolServerProcess::is_alive);
        let first_start = match (alive, slot.health) {
            (Some(true), Some(Health::Ready)) => return Ok(()),
            (Some(false), Some(Health::Ready)) => {
                let reason = slot
                    .process
                    .as_ref()
                    .and_then(ToolServerProcess::exit_reason)
                    .unwrap_or_else(|| "exited".to_string());
                warn!(agent = %agent, reason = %reason, "Tool server died while idle");
                self.set_health(agent, slot, Health::Crashed);
                false
            }
            (None, None) => true,
            _ => false,
        };

        if let Some(old) = slot.process.take() {
            if old.is_alive() {
                info!(agent = %agent, "Replacing unhealthy tool server");
                old.terminate(self.policy.shutdown_grace).await;
            }
        }

        if !first_start {
            if slot.restart_count >= self.policy.max_attempts {
                slot.exhausted = true;
                warn!(
                    agent = %agent,
                    attempts = slot.restart_count,
                    "Restart attempts exhausted, tool server permanently unavailable"
                );
                self.set_health(agent, slot, Health::Crashed);
                return Err(self.unavailable(agent));
            }

            let delay = self.policy.backoff(slot.restart_count);
            slot.restart_count += 1;
            slot.total_restarts += 1;
            info!(agent = %agent, attempt = slot.restart_count, ?delay, "Respawning tool server");
            #[cfg(feature = "telemetry")]
            crate::telemetry::GLOBAL_METRICS.record_respawn();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancelled() => return Err(CallFailure::Cancelled),
            }
        }

        self.start(agent, slot).await
    }

    /// Spawn and handshake. Leaves the slot READY on success, CRASHED otherwise.
    async fn start(&self, agent: AgentId, slot: &mut WorkerSlot) -> Result<(), CallFailure> {
        let Some(spec) = self.specs.get(&agent) else {
            return Err(CallFailure::WorkerUnavailable(format!("no tool server configured for {}", agent)));
        };

        slot.consecutive_timeouts = 0;
        self.set_health(agent, slot, Health::Starting);

        let process = match ToolServerProcess::spawn(agent, spec, &self.workspace, self.bus.clone()) {
            Ok(process) => process,
            Err(failure) => {
                warn!(agent = %agent, error = %failure, "Failed to spawn tool server");
                self.set_health(agent, slot, Health::Crashed);
                return Err(failure);
            }
        };

        let params = serde_json::json!({
            "agent": agent.as_str(),
            "session_id": self.session_id,
            "workspace_path": self.workspace.display().to_string(),
            "protocol_version": PROTOCOL_VERSION,
        });
        let request = process.prepare(METHOD_INITIALIZE, params, self.policy.handshake_timeout);
        let handshake = tokio::select! {
            result = process.send(&request) => result,
            _ = self.cancelled() => Err(CallFailure::Cancelled),
        };

        match handshake {
            Ok(_) => {
                slot.process = Some(process);
                self.set_health(agent, slot, Health::Ready);
                Ok(())
            }
            Err(CallFailure::Cancelled) => {
                process.kill().await;
                self.set_health(agent, slot, Health::Crashed);
                Err(CallFailure::Cancelled)
            }
            Err(failure) => {
                warn!(agent = %agent, error = %failure, "Tool server handshake failed");
                process.kill().await;
                self.set_health(agent, slot, Health::Crashed);
                Err(CallFailure::SpawnFailed(format!("handshake failed: {}", failure)))
            }
        }
    }

    fn set_health(&self, agent: AgentId, slot: &mut WorkerSlot, health: Health) {
        if slot.health == Some(health) && health != Health::Starting {
            return;
        }
        debug!(agent = %agent, from = ?slot.health, to = %health, "Health transition");
        slot.health = Some(health);
        self.bus.publish(
            agent.as_str(),
            EventPayload::Health {
                health,
                restart_count: slot.restart_count,
            },
        );
    }

    fn unavailable(&self, agent: AgentId) -> CallFailure {
        CallFailure::WorkerUnavailable(format!(
            "{} tool server failed {} restart attempts",
            agent, self.policy.max_attempts
        ))
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || *self.closing.borrow()
    }

    /// Resolves once the session is cancelled or the manager is shutting down.
    async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        let mut closing = self.closing.subscribe();
        tokio::select! {
            _ = wait_for_true(&mut cancel) => {}
            _ = wait_for_true(&mut closing) => {}
        }
    }

    /// Terminate every tool server. In-flight and queued calls resolve as cancelled.
    pub async fn shutdown(&self) {
        self.closing.send_replace(true);

        let mut terminations = JoinSet::new();
        for (agent, slot) in &self.slots {
            let mut slot = slot.lock().await;
            if let Some(process) = slot.process.take() {
                debug!(agent = %agent, "Stopping tool server");
                let grace = self.policy.shutdown_grace;
                terminations.spawn(async move { process.terminate(grace).await });
            }
        }
        while terminations.join_next().await.is_some() {}
        info!(session = %self.session_id, "Process manager shut down");
    }
}

/// Resolve when the flag turns true. A dropped sender never resolves.
async fn wait_for_true(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl WorkerInvoker for ProcessManager {
    async fn invoke(&self, agent: AgentId, input: WorkerInput) -> CallResult {
        self.call(agent, input, self.timeout_for(agent)).await
    }

    async fn shutdown(&self) {
        ProcessManager::shutdown(self).await
    }
}
