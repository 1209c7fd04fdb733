// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::AgentId;

use super::types::{LimitsConfig, RestartConfig, WorkerConfig, WorkspaceConfig};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    ".foreman.json",
    ".foreman/config.json",
    "foreman.config.json",
    ".foreman.yaml",
    ".foreman.yml",
];

/// Local config file name (for per-directory overrides).
pub const LOCAL_CONFIG_FILE: &str = ".foreman.local.json";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".foreman";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.foreman/config.json.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    match get_global_config_path() {
        Some(path) if path.exists() => load_config_file(&path).map(Some),
        _ => Ok(None),
    }
}

/// Load workspace configuration from the workspace root.
///
/// The first file of [`CONFIG_FILES`] that exists wins; the rest are ignored.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    CONFIG_FILES
        .iter()
        .map(|name| workspace_root.join(name))
        .find(|path| path.exists())
        .map(|path| load_config_file(&path))
        .transpose()
}

/// Load local configuration from .foreman.local.json.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML, chosen by extension).
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(WorkspaceConfig::default());
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Write a workspace configuration file, creating parent directories as needed.
pub fn save_workspace_config(
    workspace_root: &Path,
    config: &WorkspaceConfig,
    filename: Option<&str>,
) -> Result<PathBuf, ConfigError> {
    let path = workspace_root.join(filename.unwrap_or(CONFIG_FILES[0]));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::to_string(config)?,
        _ => serde_json::to_string_pretty(config)?,
    };
    std::fs::write(&path, content)?;

    Ok(path)
}

/// Write a starter config file. Refuses to overwrite an existing one.
pub fn init_config(
    workspace_root: &Path,
    config: Option<WorkspaceConfig>,
) -> Result<PathBuf, ConfigError> {
    let existing = workspace_root.join(CONFIG_FILES[0]);
    if existing.exists() {
        return Err(ConfigError::invalid(
            existing.display().to_string(),
            "config file already exists",
        ));
    }
    let config = config.unwrap_or_else(get_example_config);
    save_workspace_config(workspace_root, &config, None)
}

/// Find the workspace root by searching for config files.
///
/// Walks up the directory tree from `start` until it finds a directory
/// containing a config file or reaches the filesystem root.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| CONFIG_FILES.iter().any(|name| dir.join(name).exists()))
        .map(Path::to_path_buf)
}

/// Example configuration written by `foreman init`.
pub fn get_example_config() -> WorkspaceConfig {
    let mut workers = HashMap::new();
    workers.insert(
        AgentId::Code,
        WorkerConfig {
            command: Some("foreman-worker".to_string()),
            args: Some(vec!["--role".to_string(), "code".to_string()]),
            timeout_secs: Some(300),
            ..Default::default()
        },
    );

    WorkspaceConfig {
        workers: Some(workers),
        limits: Some(LimitsConfig {
            max_iterations: Some(20),
            max_calls_per_worker: Some(3),
            error_threshold: Some(3),
            session_timeout_secs: Some(1800),
        }),
        restart: Some(RestartConfig {
            max_attempts: Some(3),
            ..Default::default()
        }),
        require_approval: Some(false),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_files_order() {
        assert_eq!(CONFIG_FILES[0], ".foreman.json");
        assert!(CONFIG_FILES.contains(&".foreman.yaml"));
    }

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".foreman"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_workspace_config_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.json"),
            r#"{"limits": {"maxIterations": 7}, "requireApproval": true}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.limits.unwrap().max_iterations, Some(7));
        assert_eq!(config.require_approval, Some(true));
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.yaml"),
            "workers:\n  review:\n    command: reviewer\n    timeoutSecs: 30\nevents:\n  capacity: 16\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        let workers = config.workers.unwrap();
        assert_eq!(
            workers.get(&AgentId::Review).unwrap().command.as_deref(),
            Some("reviewer")
        );
        assert_eq!(config.events.unwrap().capacity, Some(16));
    }

    #[test]
    fn test_json_takes_priority_over_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.json"), r#"{"requireApproval": true}"#).unwrap();
        std::fs::write(temp.path().join(".foreman.yaml"), "requireApproval: false\n").unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.require_approval, Some(true));
    }

    #[test]
    fn test_invalid_json_is_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.json"), "{ nope").unwrap();
        let result = load_workspace_config(temp.path());
        assert!(matches!(result, Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_empty_file_is_default() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.json"), "  \n").unwrap();
        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert!(config.limits.is_none());
    }

    #[test]
    fn test_save_workspace_config_nested() {
        let temp = TempDir::new().unwrap();
        let config = WorkspaceConfig {
            socket_path: Some("/tmp/f.sock".to_string()),
            ..Default::default()
        };

        let path = save_workspace_config(temp.path(), &config, Some(".foreman/config.json")).unwrap();
        assert!(path.exists());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("socketPath"));
    }

    #[test]
    fn test_find_workspace_root() {
        let temp = TempDir::new().unwrap();
        let subdir = temp.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(temp.path().join(".foreman.json"), "{}").unwrap();

        let found = find_workspace_root(&subdir);
        assert_eq!(found.unwrap(), temp.path());
    }

    #[test]
    fn test_find_workspace_root_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(find_workspace_root(temp.path()).is_none());
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), None).unwrap();
        assert_eq!(path.file_name().unwrap(), ".foreman.json");

        let again = init_config(temp.path(), None);
        assert!(matches!(again, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_example_config_parses_back() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path(), None).unwrap();
        let loaded = load_config_file(&path).unwrap();
        assert!(loaded.workers.unwrap().contains_key(&AgentId::Code));
    }
}
