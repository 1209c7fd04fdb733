// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use super::types::{ResolvedConfig, ResolvedWorkerConfig, WorkerConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub max_iterations: Option<u32>,
    pub max_calls_per_worker: Option<u32>,
    pub error_threshold: Option<usize>,
    pub session_timeout_secs: Option<u64>,
    pub require_approval: Option<bool>,
    pub socket_path: Option<PathBuf>,
    /// Replace the command of every worker (roles still get `--role <agent>`).
    pub worker_command: Option<String>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.foreman.local.json)
/// 3. Workspace config (.foreman.json and friends)
/// 4. Global config (~/.foreman/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].iter().flatten() {
        apply_workspace_config(&mut result, config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref workers) = config.workers {
        for (agent, worker) in workers {
            let resolved = result
                .workers
                .entry(*agent)
                .or_insert_with(|| ResolvedWorkerConfig::default_for(*agent));
            apply_worker_config(resolved, worker);
        }
    }

    if let Some(ref limits) = config.limits {
        if let Some(v) = limits.max_iterations {
            result.max_iterations = v;
        }
        if let Some(v) = limits.max_calls_per_worker {
            result.max_calls_per_worker = v;
        }
        if let Some(v) = limits.error_threshold {
            result.error_threshold = v;
        }
        if let Some(v) = limits.session_timeout_secs {
            result.session_timeout_secs = v;
        }
    }

    if let Some(ref restart) = config.restart {
        if let Some(v) = restart.max_attempts {
            result.restart_max_attempts = v;
        }
        if let Some(v) = restart.base_delay_ms {
            result.restart_base_delay_ms = v;
        }
        if let Some(v) = restart.max_delay_ms {
            result.restart_max_delay_ms = v;
        }
        if let Some(v) = restart.consecutive_timeouts_unhealthy {
            result.unhealthy_after_timeouts = v;
        }
        if let Some(v) = restart.shutdown_grace_ms {
            result.shutdown_grace_ms = v;
        }
        if let Some(v) = restart.handshake_timeout_secs {
            result.handshake_timeout_secs = v;
        }
    }

    if let Some(capacity) = config.events.as_ref().and_then(|e| e.capacity) {
        result.event_capacity = capacity;
    }

    if let Some(require_approval) = config.require_approval {
        result.require_approval = require_approval;
    }

    if let Some(ref socket_path) = config.socket_path {
        result.socket_path = expand_home(socket_path);
    }
}

/// Field-by-field overlay; env maps are merged rather than replaced.
fn apply_worker_config(result: &mut ResolvedWorkerConfig, config: &WorkerConfig) {
    if let Some(ref command) = config.command {
        result.command = command.clone();
    }
    if let Some(ref args) = config.args {
        result.args = args.clone();
    }
    if let Some(ref env) = config.env {
        result.env.extend(env.clone());
    }
    if config.cwd.is_some() {
        result.cwd = config.cwd.clone();
    }
    if let Some(timeout) = config.timeout_secs {
        result.timeout_secs = timeout;
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(v) = cli.max_iterations {
        result.max_iterations = v;
    }
    if let Some(v) = cli.max_calls_per_worker {
        result.max_calls_per_worker = v;
    }
    if let Some(v) = cli.error_threshold {
        result.error_threshold = v;
    }
    if let Some(v) = cli.session_timeout_secs {
        result.session_timeout_secs = v;
    }
    if let Some(v) = cli.require_approval {
        result.require_approval = v;
    }
    if let Some(ref path) = cli.socket_path {
        result.socket_path = path.clone();
    }
    if let Some(ref command) = cli.worker_command {
        for worker in result.workers.values_mut() {
            worker.command = command.clone();
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{EventsConfig, LimitsConfig};
    use crate::types::AgentId;
    use std::collections::HashMap;

    fn workers(agent: AgentId, worker: WorkerConfig) -> Option<HashMap<AgentId, WorkerConfig>> {
        let mut map = HashMap::new();
        map.insert(agent, worker);
        Some(map)
    }

    #[test]
    fn test_merge_with_nothing_is_default() {
        let config = merge_config(None, None, None, CliOptions::default());
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.event_capacity, 1024);
        assert!(!config.require_approval);
    }

    #[test]
    fn test_precedence_order() {
        let limits = |n| WorkspaceConfig {
            limits: Some(LimitsConfig {
                max_iterations: Some(n),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = merge_config(Some(limits(5)), Some(limits(6)), None, CliOptions::default());
        assert_eq!(config.max_iterations, 6);

        let config = merge_config(
            Some(limits(5)),
            Some(limits(6)),
            Some(limits(7)),
            CliOptions::default(),
        );
        assert_eq!(config.max_iterations, 7);

        let cli = CliOptions {
            max_iterations: Some(8),
            ..Default::default()
        };
        let config = merge_config(Some(limits(5)), Some(limits(6)), Some(limits(7)), cli);
        assert_eq!(config.max_iterations, 8);
    }

    #[test]
    fn test_worker_fields_overlay() {
        let global = WorkspaceConfig {
            workers: workers(
                AgentId::Code,
                WorkerConfig {
                    command: Some("coder".to_string()),
                    env: Some(HashMap::from([("A".to_string(), "1".to_string())])),
                    ..Default::default()
                },
            ),
            ..Default::default()
        };
        let workspace = WorkspaceConfig {
            workers: workers(
                AgentId::Code,
                WorkerConfig {
                    timeout_secs: Some(42),
                    env: Some(HashMap::from([("B".to_string(), "2".to_string())])),
                    ..Default::default()
                },
            ),
            ..Default::default()
        };

        let config = merge_config(Some(global), Some(workspace), None, CliOptions::default());
        let code = &config.workers[&AgentId::Code];
        assert_eq!(code.command, "coder");
        assert_eq!(code.timeout_secs, 42);
        assert_eq!(code.env.len(), 2);
        // untouched roles keep their defaults
        assert_eq!(config.workers[&AgentId::Review].timeout_secs, 120);
    }

    #[test]
    fn test_cli_worker_command_applies_to_all() {
        let cli = CliOptions {
            worker_command: Some("/bin/mock".to_string()),
            ..Default::default()
        };
        let config = merge_config(None, None, None, cli);
        assert!(config.workers.values().all(|w| w.command == "/bin/mock"));
        assert_eq!(config.workers[&AgentId::Design].args[1], "design");
    }

    #[test]
    fn test_events_capacity() {
        let workspace = WorkspaceConfig {
            events: Some(EventsConfig { capacity: Some(8) }),
            ..Default::default()
        };
        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        assert_eq!(config.event_capacity, 8);
    }

    #[test]
    fn test_socket_path_home_expansion() {
        let workspace = WorkspaceConfig {
            socket_path: Some("~/run/f.sock".to_string()),
            ..Default::default()
        };
        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.socket_path, home.join("run/f.sock"));
        }
    }
}
