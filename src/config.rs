use crate::utils::{get_config_dir, write_private_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides [`BackendConfig::command`] when set (whitespace-separated argv)
pub const BACKEND_COMMAND_ENV: &str = "FWVAULT_BACKEND_COMMAND";

/// Upper bound for the backend apply timeout
pub const MAX_APPLY_TIMEOUT_SECS: u64 = 3600;

/// How the engine reaches its enforcement backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Program and arguments; empty means dry run
    #[serde(default)]
    pub command: Vec<String>,
    /// Run the program through `sudo -n` when not already root
    #[serde(default)]
    pub elevate: bool,
}

impl BackendConfig {
    /// Effective argv: the environment override wins over the config file.
    pub fn command(&self) -> Vec<String> {
        match std::env::var(BACKEND_COMMAND_ENV) {
            Ok(value) if !value.trim().is_empty() => {
                value.split_whitespace().map(str::to_string).collect()
            }
            _ => self.command.clone(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds to wait for backend confirmation (default: 30s, clamped to 1..=3600)
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    /// Refuse to snapshot an empty rule set
    #[serde(default = "default_true")]
    pub require_non_empty_baseline: bool,
    /// Versions per page in history listings
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
    /// Write the audit log to `<state dir>/audit.log`
    #[serde(default = "default_true")]
    pub audit_log_enabled: bool,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            apply_timeout_secs: default_apply_timeout(),
            require_non_empty_baseline: true,
            history_page_size: default_history_page_size(),
            audit_log_enabled: true,
            backend: BackendConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs.clamp(1, MAX_APPLY_TIMEOUT_SECS))
    }

    pub fn history_page_size(&self) -> usize {
        self.history_page_size.max(1)
    }
}

fn default_true() -> bool {
    true
}

fn default_apply_timeout() -> u64 {
    30
}

fn default_history_page_size() -> usize {
    20
}

pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config atomically with owner-only permissions.
pub async fn save_config_to(path: &Path, config: &EngineConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        crate::utils::create_private_dir(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    write_private_atomic(path, json.as_bytes()).await
}

pub async fn save_config(config: &EngineConfig) -> std::io::Result<()> {
    match default_config_path() {
        Some(path) => save_config_to(&path, config).await,
        None => Ok(()),
    }
}

/// Loads the config, or returns defaults if missing or unreadable.
pub async fn load_config_from(path: &Path) -> EngineConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<EngineConfig>(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
                EngineConfig::default()
            }
        },
        Err(_) => EngineConfig::default(),
    }
}

pub async fn load_config() -> EngineConfig {
    match default_config_path() {
        Some(path) => load_config_from(&path).await,
        None => EngineConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.apply_timeout(), Duration::from_secs(30));
        assert!(config.require_non_empty_baseline);
        assert_eq!(config.history_page_size(), 20);
        assert!(config.audit_log_enabled);
        assert!(config.backend.command.is_empty());
    }

    #[test]
    fn test_timeout_clamped() {
        let mut config = EngineConfig {
            apply_timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.apply_timeout(), Duration::from_secs(1));
        config.apply_timeout_secs = 1_000_000;
        assert_eq!(config.apply_timeout(), Duration::from_secs(MAX_APPLY_TIMEOUT_SECS));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"apply_timeout_secs": 5, "backend": {"command": ["true"]}}"#)
                .unwrap();
        assert_eq!(config.apply_timeout_secs, 5);
        assert!(config.require_non_empty_baseline);
        assert_eq!(config.backend.command, vec!["true".to_string()]);
        assert!(!config.backend.elevate);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = EngineConfig {
            history_page_size: 7,
            ..EngineConfig::default()
        };

        save_config_to(&path, &config).await.unwrap();
        assert_eq!(load_config_from(&path).await, config);
    }

    #[tokio::test]
    async fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(load_config_from(&path).await, EngineConfig::default());
        assert_eq!(
            load_config_from(&dir.path().join("missing.json")).await,
            EngineConfig::default()
        );
    }
}
