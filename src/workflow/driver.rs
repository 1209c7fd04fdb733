// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The workflow driver loop.
//!
//! Each tick asks the supervisor for a decision, dispatches at most one worker
//! call, waits for it to retire and merges the result. The driver is the only
//! writer of [`WorkflowState`]; readers get copies through [`StateSnapshot`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventBus, EventPayload};
use crate::process::{CallResult, WorkerInvoker};
use crate::telemetry::TimedOperation;
use crate::types::{WorkerInput, SUPERVISOR};

use super::state::{StatePatch, WorkflowState};
use super::supervisor::{Next, RoutingDecision, Supervisor, TerminationReason};

/// Default wall-clock limit for a whole session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    pub termination: TerminationReason,
    pub final_response: String,
    pub iterations: u32,
    pub calls: u32,
    pub errors: usize,
}

impl WorkflowOutcome {
    pub fn is_degraded(&self) -> bool {
        self.termination.is_degraded()
    }
}

/// Read-only view of a running session's state.
#[derive(Debug, Clone)]
pub struct StateSnapshot(watch::Receiver<WorkflowState>);

impl StateSnapshot {
    /// Copy of the state as of the last merged call.
    pub fn get(&self) -> WorkflowState {
        self.0.borrow().clone()
    }

    /// Wait for the next merge. Returns `false` once the driver is gone.
    pub async fn changed(&mut self) -> bool {
        self.0.changed().await.is_ok()
    }
}

pub struct WorkflowDriver {
    supervisor: Supervisor,
    invoker: Arc<dyn WorkerInvoker>,
    bus: EventBus,
    state: WorkflowState,
    snapshots: watch::Sender<WorkflowState>,
    cancel: watch::Receiver<bool>,
    session_timeout: Duration,
}

impl WorkflowDriver {
    pub fn new(
        supervisor: Supervisor,
        invoker: Arc<dyn WorkerInvoker>,
        bus: EventBus,
        state: WorkflowState,
    ) -> Self {
        let (snapshots, _) = watch::channel(state.clone());
        // Never cancelled unless replaced.
        let (_, cancel) = watch::channel(false);
        Self {
            supervisor,
            invoker,
            bus,
            state,
            snapshots,
            cancel,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn snapshot(&self) -> WorkflowState {
        self.state.clone()
    }

    /// Handle for readers on other tasks.
    pub fn subscribe(&self) -> StateSnapshot {
        StateSnapshot(self.snapshots.subscribe())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Drive the session to completion.
    ///
    /// Always ends with a `result` event on the bus, after which the bus is
    /// closed and the invoker shut down.
    #[instrument(skip_all, fields(session = %self.state.session_id, mode = %self.state.mode))]
    pub async fn run(&mut self) -> WorkflowOutcome {
        let timer = TimedOperation::start("workflow.run");
        let deadline = Instant::now() + self.session_timeout;
        info!(query = %self.state.user_query, "Workflow started");

        let termination = loop {
            if let Some(ref termination) = self.state.termination {
                break termination.clone();
            }
            if *self.cancel.borrow() {
                break self.stop(TerminationReason::Cancelled);
            }
            if Instant::now() >= deadline {
                break self.stop(TerminationReason::SessionTimeout);
            }

            self.state.begin_tick();
            let decision = self.supervisor.decide(&self.state);
            self.publish_decision(&decision);
            self.state.apply_patch(&decision.state_patch);

            let Next::Agent(agent) = decision.next_agent else {
                continue;
            };

            debug!(agent = %agent, iteration = self.state.iteration, "Dispatching call");
            self.bus.publish(
                agent.as_str(),
                EventPayload::CallDispatched {
                    iteration: self.state.iteration,
                },
            );

            let input = WorkerInput {
                instructions: decision.instructions,
                workspace_path: self.state.workspace_path.clone(),
                prior_artifacts: self.state.artifacts.clone(),
            };

            let invoker = Arc::clone(&self.invoker);
            let mut cancel = self.cancel.clone();
            let retired = tokio::select! {
                result = invoker.invoke(agent, input) => Ok(result),
                _ = wait_for_true(&mut cancel) => Err(TerminationReason::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(TerminationReason::SessionTimeout),
            };
            let result = match retired {
                Ok(result) => result,
                Err(reason) => {
                    warn!(agent = %agent, "Abandoning in-flight call: {}", reason);
                    break self.stop(reason);
                }
            };

            self.merge(result);
        };

        let outcome = self.finish(termination).await;
        timer.finish();
        outcome
    }

    fn publish_decision(&self, decision: &RoutingDecision) {
        self.bus.publish(
            SUPERVISOR,
            EventPayload::Decision {
                next: decision.next_agent.to_string(),
                instructions: decision.instructions.clone(),
                confidence: decision.confidence,
                iteration: self.state.iteration,
            },
        );
    }

    fn merge(&mut self, result: CallResult) {
        let error = result
            .outcome
            .as_ref()
            .err()
            .map(|failure| failure.to_string());
        if let Some(ref message) = error {
            warn!(agent = %result.agent, code = ?result.error_code(), "Call failed: {}", message);
        }
        self.bus.publish(
            result.agent.as_str(),
            EventPayload::CallFinished {
                ok: result.ok(),
                error,
                duration_ms: result.duration.as_millis() as u64,
            },
        );

        self.state.record_call(&result);
        self.snapshots.send_replace(self.state.clone());
    }

    /// End the session from outside the supervisor.
    fn stop(&mut self, reason: TerminationReason) -> TerminationReason {
        let response = match reason {
            TerminationReason::Cancelled => format!(
                "The session was cancelled before it finished. Partial results: {}.",
                self.state.artifact_summary()
            ),
            _ => format!(
                "The session ran out of time before it finished. Partial results: {}.",
                self.state.artifact_summary()
            ),
        };
        self.state.apply_patch(&StatePatch {
            termination: Some(reason.clone()),
            final_response: Some(response),
        });
        reason
    }

    async fn finish(&mut self, termination: TerminationReason) -> WorkflowOutcome {
        let final_response = self.state.final_response.clone().unwrap_or_default();
        self.snapshots.send_replace(self.state.clone());

        if let Some(kind) = termination.error_kind() {
            self.bus
                .publish(SUPERVISOR, EventPayload::error(kind.as_str(), final_response.clone()));
        }
        self.bus.publish(
            SUPERVISOR,
            EventPayload::Result {
                final_response: final_response.clone(),
                termination: termination.as_str().to_string(),
                degraded: termination.is_degraded(),
            },
        );

        self.invoker.shutdown().await;
        self.bus.close();

        let outcome = WorkflowOutcome {
            termination,
            final_response,
            iterations: self.state.iteration,
            calls: self.state.total_calls(),
            errors: self.state.errors.len(),
        };
        info!(
            termination = %outcome.termination,
            iterations = outcome.iterations,
            calls = outcome.calls,
            errors = outcome.errors,
            "Workflow finished"
        );
        outcome
    }
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
    use crate::events::ProgressEvent;
    use crate::process::CallFailure;
    use crate::types::{AgentId, Mode, WorkerOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers every call with a fixed output per agent.
    struct Canned {
        calls: Mutex<Vec<AgentId>>,
        hang: Option<AgentId>,
        shutdowns: Mutex<u32>,
    }

    impl Canned {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                hang: None,
                shutdowns: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkerInvoker for Canned {
        async fn invoke(&self, agent: AgentId, _input: WorkerInput) -> CallResult {
            self.calls.lock().unwrap().push(agent);
            if self.hang == Some(agent) {
                std::future::pending::<()>().await;
            }
            let output = match agent {
                AgentId::Research => WorkerOutput::with_artifact("research", "notes"),
                AgentId::Respond => WorkerOutput::with_artifact("final_response", "All done."),
                AgentId::Code => return CallResult::failure(
                    agent,
                    1,
                    CallFailure::ProcessCrashed("exit status: 1".to_string()),
                    Duration::from_millis(3),
                ),
                other => WorkerOutput::with_artifact(other.as_str(), "x"),
            };
            CallResult::success(agent, 1, output, Duration::from_millis(2))
        }

        async fn shutdown(&self) {
            *self.shutdowns.lock().unwrap() += 1;
        }
    }

    fn driver(mode: Mode, invoker: Arc<Canned>) -> WorkflowDriver {
        let bus = EventBus::new("s1", 256);
        let state = WorkflowState::new("s1", mode, "how does it work", "/ws");
        WorkflowDriver::new(Supervisor::default(), invoker, bus, state)
    }

    #[tokio::test]
    async fn test_run_to_completion_ends_with_result() {
        let invoker = Arc::new(Canned::new());
        let mut driver = driver(Mode::Explain, Arc::clone(&invoker));
        let bus = driver.bus().clone();

        let outcome = driver.run().await;

        assert_eq!(outcome.termination, TerminationReason::Completed);
        assert_eq!(outcome.final_response, "All done.");
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.calls, 2);
        assert_eq!(*invoker.calls.lock().unwrap(), vec![AgentId::Research, AgentId::Respond]);
        assert_eq!(*invoker.shutdowns.lock().unwrap(), 1);

        let events: Vec<ProgressEvent> = bus.drain();
        assert!(bus.is_closed());
        let last = events.last().unwrap();
        assert!(matches!(last.payload, EventPayload::Result { degraded: false, .. }));
        let decisions = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Decision { .. }))
            .count();
        assert_eq!(decisions, 3);
    }

    #[tokio::test]
    async fn test_failures_reach_error_threshold() {
        let invoker = Arc::new(Canned::new());
        let mut driver = driver(Mode::Fix, Arc::clone(&invoker));
        let bus = driver.bus().clone();

        let outcome = driver.run().await;

        assert_eq!(outcome.termination, TerminationReason::ErrorThreshold);
        assert_eq!(outcome.errors, 4);
        assert_eq!(invoker.calls.lock().unwrap().len(), 4);
        assert!(outcome.is_degraded());

        let events = bus.drain();
        let n = events.len();
        assert!(matches!(events[n - 2].payload, EventPayload::Error { ref code, .. } if code == "error_threshold_reached"));
        assert!(matches!(events[n - 1].payload, EventPayload::Result { degraded: true, .. }));
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight_call() {
        let invoker = Arc::new(Canned {
            hang: Some(AgentId::Research),
            ..Canned::new()
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut driver = driver(Mode::Explain, Arc::clone(&invoker)).with_cancel(cancel_rx);
        let mut snapshots = driver.subscribe();

        let handle = tokio::spawn(async move { driver.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send_replace(true);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.termination, TerminationReason::Cancelled);
        assert!(outcome.final_response.contains("cancelled"));
        assert_eq!(*invoker.shutdowns.lock().unwrap(), 1);

        snapshots.changed().await;
        assert!(snapshots.get().is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout() {
        let invoker = Arc::new(Canned {
            hang: Some(AgentId::Research),
            ..Canned::new()
        });
        let mut driver = driver(Mode::Explain, invoker).with_session_timeout(Duration::from_secs(5));

        let outcome = driver.run().await;
        assert_eq!(outcome.termination, TerminationReason::SessionTimeout);
        assert_eq!(driver.state().termination, Some(TerminationReason::SessionTimeout));
    }

    #[tokio::test]
    async fn test_snapshot_tracks_merges() {
        let invoker = Arc::new(Canned::new());
        let mut driver = driver(Mode::Explain, invoker);
        let snapshots = driver.subscribe();
        assert_eq!(snapshots.get().iteration, 0);

        driver.run().await;
        let state = snapshots.get();
        assert!(state.response_ready);
        assert_eq!(state.call_count(AgentId::Research), 1);
        assert_eq!(driver.snapshot().iteration, 3);
    }
}
