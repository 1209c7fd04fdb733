// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for Foreman.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.foreman/config.json
//! - Workspace config: .foreman.json, .foreman/config.json, foreman.config.json or .foreman.yaml
//! - Local config: .foreman.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments and FOREMAN_* environment variables
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_example_config, get_global_config_dir, get_global_config_path,
    init_config, load_config_file, load_global_config, load_local_config, load_workspace_config,
    save_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    default_socket_path, EventsConfig, LimitsConfig, ResolvedConfig, ResolvedWorkerConfig,
    RestartConfig, WorkerConfig, WorkspaceConfig, DEFAULT_WORKER_COMMAND,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load, merge and validate all configuration sources for a workspace.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    let config = merge_config(global, workspace, local, cli_options);
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_no_files() {
        let temp = TempDir::new().unwrap();
        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert!(!config.workers.is_empty());
    }

    #[test]
    fn test_load_config_local_overrides_workspace() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.json"),
            r#"{"limits": {"errorThreshold": 9}, "requireApproval": true}"#,
        )
        .unwrap();
        std::fs::write(
            temp.path().join(LOCAL_CONFIG_FILE),
            r#"{"requireApproval": false}"#,
        )
        .unwrap();

        let config = load_config(temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.error_threshold, 9);
        assert!(!config.require_approval);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.json"),
            r#"{"events": {"capacity": 0}}"#,
        )
        .unwrap();

        let result = load_config(temp.path(), CliOptions::default());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
