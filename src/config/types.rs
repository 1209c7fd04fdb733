// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`WorkspaceConfig`] mirrors what users write (everything optional, JSON or
//! YAML, camelCase). [`ResolvedConfig`] is the merged result with every value
//! concrete; it hands out the domain policies consumed by the process manager
//! and the supervisor.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::process::{RestartPolicy, WorkerSpec};
use crate::types::AgentId;
use crate::workflow::SupervisorPolicy;

/// Workspace configuration for Foreman.
/// Can be defined in .foreman.json or .foreman/config.json in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Tool-server settings per worker role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<HashMap<AgentId, WorkerConfig>>,

    /// Supervisor termination limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    /// Respawn and shutdown behaviour for tool-server processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartConfig>,

    /// Event bus settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsConfig>,

    /// Route passing work through the human approval worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_approval: Option<bool>,

    /// Socket the streaming server listens on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

/// Tool-server settings for one worker role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Executable to spawn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments passed to the executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Extra environment variables
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Working directory (defaults to the session workspace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Call timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Supervisor limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_calls_per_worker: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<u64>,
}

/// Tool-server restart settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_timeouts_unhealthy: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
}

/// Event bus settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsConfig {
    /// Maximum buffered events before low-priority events are dropped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

// ============================================================================
// Resolved Configuration
// ============================================================================

/// Fully resolved tool-server settings for one worker role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub timeout_secs: u64,
}

impl ResolvedWorkerConfig {
    /// Default tool server for a role: one shared executable told which role to play.
    pub fn default_for(agent: AgentId) -> Self {
        Self {
            command: DEFAULT_WORKER_COMMAND.to_string(),
            args: vec!["--role".to_string(), agent.as_str().to_string()],
            env: HashMap::new(),
            cwd: None,
            timeout_secs: agent.default_timeout().as_secs(),
        }
    }
}

/// Executable spawned for every role unless configured otherwise.
pub const DEFAULT_WORKER_COMMAND: &str = "foreman-worker";

/// Fully resolved configuration with all values set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub workers: BTreeMap<AgentId, ResolvedWorkerConfig>,
    pub max_iterations: u32,
    pub max_calls_per_worker: u32,
    pub error_threshold: usize,
    pub session_timeout_secs: u64,
    pub restart_max_attempts: u32,
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    pub unhealthy_after_timeouts: u32,
    pub shutdown_grace_ms: u64,
    pub handshake_timeout_secs: u64,
    pub event_capacity: usize,
    pub require_approval: bool,
    pub socket_path: PathBuf,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            workers: AgentId::ALL
                .iter()
                .map(|agent| (*agent, ResolvedWorkerConfig::default_for(*agent)))
                .collect(),
            max_iterations: 20,
            max_calls_per_worker: 3,
            error_threshold: 3,
            session_timeout_secs: 1800,
            restart_max_attempts: 3,
            restart_base_delay_ms: 1000,
            restart_max_delay_ms: 4000,
            unhealthy_after_timeouts: 2,
            shutdown_grace_ms: 2000,
            handshake_timeout_secs: 10,
            event_capacity: 1024,
            require_approval: false,
            socket_path: default_socket_path(),
        }
    }
}

impl ResolvedConfig {
    /// Check that the merged values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("limits.maxIterations", "must be at least 1"));
        }
        if self.max_calls_per_worker == 0 {
            return Err(ConfigError::invalid(
                "limits.maxCallsPerWorker",
                "must be at least 1",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid("events.capacity", "must be at least 1"));
        }
        if self.restart_base_delay_ms > self.restart_max_delay_ms {
            return Err(ConfigError::invalid(
                "restart.baseDelayMs",
                "must not exceed restart.maxDelayMs",
            ));
        }
        for (agent, worker) in &self.workers {
            if worker.command.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("workers.{}.command", agent),
                    "must not be empty",
                ));
            }
            if worker.timeout_secs == 0 {
                return Err(ConfigError::invalid(
                    format!("workers.{}.timeoutSecs", agent),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }

    /// Limits for the decision engine.
    pub fn supervisor_policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            max_iterations: self.max_iterations,
            max_calls_per_worker: self.max_calls_per_worker,
            error_threshold: self.error_threshold,
            require_approval: self.require_approval,
        }
    }

    /// Respawn policy for the process manager.
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_attempts: self.restart_max_attempts,
            base_delay: Duration::from_millis(self.restart_base_delay_ms),
            max_delay: Duration::from_millis(self.restart_max_delay_ms),
            unhealthy_after_timeouts: self.unhealthy_after_timeouts,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }

    /// Overall session budget.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Spawn specs for every configured role.
    pub fn worker_specs(&self) -> BTreeMap<AgentId, WorkerSpec> {
        self.workers
            .iter()
            .map(|(agent, worker)| {
                (
                    *agent,
                    WorkerSpec {
                        command: worker.command.clone(),
                        args: worker.args.clone(),
                        env: worker.env.clone(),
                        cwd: worker.cwd.as_ref().map(PathBuf::from),
                        timeout: Duration::from_secs(worker.timeout_secs),
                    },
                )
            })
            .collect()
    }
}

/// Default streaming socket: ~/.foreman/foreman.sock, or the temp dir when
/// there is no home directory.
pub fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".foreman"))
        .unwrap_or_else(std::env::temp_dir)
        .join("foreman.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_defaults() {
        let config = ResolvedConfig::default();
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.max_calls_per_worker, 3);
        assert_eq!(config.error_threshold, 3);
        assert_eq!(config.restart_max_attempts, 3);
        assert_eq!(config.workers.len(), AgentId::ALL.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_worker_uses_role_arg() {
        let worker = ResolvedWorkerConfig::default_for(AgentId::Review);
        assert_eq!(worker.command, DEFAULT_WORKER_COMMAND);
        assert_eq!(worker.args, vec!["--role".to_string(), "review".to_string()]);
        assert_eq!(worker.timeout_secs, 120);
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let config = ResolvedConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = ResolvedConfig {
            restart_base_delay_ms: 5000,
            restart_max_delay_ms: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workspace_config_agent_keys() {
        let json = r#"{
            "workers": {
                "code": { "command": "python3", "args": ["coder.py"], "timeoutSecs": 600 }
            },
            "limits": { "maxIterations": 150 }
        }"#;
        let config: WorkspaceConfig = serde_json::from_str(json).unwrap();
        let workers = config.workers.unwrap();
        let code = workers.get(&AgentId::Code).unwrap();
        assert_eq!(code.command.as_deref(), Some("python3"));
        assert_eq!(code.timeout_secs, Some(600));
        assert_eq!(config.limits.unwrap().max_iterations, Some(150));
    }

    #[test]
    fn test_policies_from_resolved() {
        let config = ResolvedConfig {
            restart_base_delay_ms: 10,
            restart_max_delay_ms: 40,
            require_approval: true,
            ..Default::default()
        };
        let restart = config.restart_policy();
        assert_eq!(restart.base_delay, Duration::from_millis(10));
        assert_eq!(restart.max_delay, Duration::from_millis(40));

        let policy = config.supervisor_policy();
        assert!(policy.require_approval);
        assert_eq!(policy.max_iterations, 20);
    }
}
