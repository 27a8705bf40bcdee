use std::path::Path;
use std::time::Duration;

use events::RetentionPolicy;
use orchestrator::RunSettings;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::StartupError;

pub const DEFAULT_CONFIG_FILE: &str = "agent-protocol.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    /// Grace period before a canceled run is force-terminated
    pub cancel_grace_ms: u64,
    /// Evict in-memory logs this long after the terminal event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
    pub janitor_interval_secs: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 5000,
            retention_secs: None,
            janitor_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite URL of the durable event store, e.g. `sqlite:events.db`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

/// An agent served by another process, mounted locally under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAgentConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Serve the built-in `echo` and `delegate` agents
    pub builtin: bool,
    pub remote: Vec<RemoteAgentConfig>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            remote: Vec::new(),
        }
    }
}

/// Server configuration, stored as TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub server: ServerConfig,
    pub runs: RunsConfig,
    pub storage: StorageConfig,
    pub agents: AgentsConfig,
}

impl ProtocolConfig {
    /// Read config from `path`, falling back to defaults when the file is missing
    pub async fn load(path: &Path) -> Result<Self, StartupError> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|source| StartupError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
        let config = toml::from_str(&content).map_err(|source| StartupError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Config loaded successfully");
        Ok(config)
    }

    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, content).await?;
        debug!(path = %path.display(), "Config saved successfully");

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            cancel_grace: Duration::from_millis(self.runs.cancel_grace_ms),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        match self.runs.retention_secs {
            Some(secs) => RetentionPolicy::evict_after(Duration::from_secs(secs)),
            None => RetentionPolicy::keep_forever(),
        }
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.runs.janitor_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProtocolConfig::load(&temp_dir.path().join(DEFAULT_CONFIG_FILE))
            .await
            .unwrap();

        assert_eq!(config, ProtocolConfig::default());
        assert_eq!(config.bind_address(), "0.0.0.0:3001");
        assert_eq!(config.retention(), RetentionPolicy::keep_forever());
        assert!(config.agents.builtin);
    }

    #[tokio::test]
    async fn test_config_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(DEFAULT_CONFIG_FILE);

        let mut config = ProtocolConfig::default();
        config.server.port = 4000;
        config.runs.retention_secs = Some(600);
        config.storage.database_url = Some("sqlite:events.db".to_string());
        config.agents.remote.push(RemoteAgentConfig {
            name: "far-echo".to_string(),
            url: "http://other:3001/echo".to_string(),
        });
        config.write(&path).await.unwrap();

        let loaded = ProtocolConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.retention(),
            RetentionPolicy::evict_after(Duration::from_secs(600))
        );
    }

    #[tokio::test]
    async fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[runs]\ncancel_grace_ms = 250\n").unwrap();

        let config = ProtocolConfig::load(&path).await.unwrap();
        assert_eq!(config.run_settings().cancel_grace, Duration::from_millis(250));
        assert_eq!(config.runs.janitor_interval_secs, 30);
        assert_eq!(config.server, ServerConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[server]\nport = \"not a number\"\n").unwrap();

        let err = ProtocolConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, StartupError::ConfigParse { .. }));
    }
}
