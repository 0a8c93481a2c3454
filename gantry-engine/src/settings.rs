// Engine settings
// Operator-level knobs, loaded from an optional YAML file and overridden by CLI flags

use crate::parser::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings that shape how a run executes, independent of the job graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct EngineSettings {
    /// Maximum number of instances running at once
    pub concurrency: usize,

    /// Time between SIGTERM and a forced kill
    pub kill_grace_period_seconds: u64,

    /// Sidecar health check polling interval
    pub health_check_interval_ms: u64,

    /// Parent directory for instance workspaces (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,

    /// Container CLI used for sidecars
    pub container_runtime: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            kill_grace_period_seconds: 10,
            health_check_interval_ms: 1000,
            workspace_root: None,
            container_runtime: "docker".to_string(),
        }
    }
}

impl EngineSettings {
    /// Default settings file: `<config_dir>/gantry/settings.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gantry").join("settings.yaml"))
    }

    /// Load settings.
    ///
    /// An explicit path must exist. Without one, the default path is used when
    /// present and built-in defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::io(&path, &e))?;
        let settings = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "loaded engine settings");
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Self = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::from_yaml_error(&e, content).at("settings"))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::invalid_value("concurrency must be at least 1")
                .at("settings.concurrency"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::invalid_value("health-check-interval-ms must be positive")
                .at("settings.health-check-interval-ms"));
        }
        if self.container_runtime.trim().is_empty() {
            return Err(ConfigError::invalid_value("container-runtime is empty")
                .at("settings.container-runtime"));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Directory new instance workspaces are created in
    pub fn workspace_parent(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();

        assert!(settings.concurrency >= 1);
        assert_eq!(settings.kill_grace(), Duration::from_secs(10));
        assert_eq!(settings.health_check_interval(), Duration::from_secs(1));
        assert_eq!(settings.container_runtime, "docker");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = EngineSettings::parse("concurrency: 3\ncontainer-runtime: podman\n").unwrap();

        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.container_runtime, "podman");
        assert_eq!(settings.kill_grace_period_seconds, 10);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(EngineSettings::parse("paralellism: 3\n").is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = EngineSettings::parse("concurrency: 0\n").unwrap_err();
        assert!(err.message.contains("concurrency"));
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(EngineSettings::parse("\n").unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "workspace-root: /var/tmp\n").unwrap();

        let settings = EngineSettings::load(Some(&path)).unwrap();

        assert_eq!(settings.workspace_parent(), PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let missing = Path::new("/nonexistent/gantry/settings.yaml");
        assert!(EngineSettings::load(Some(missing)).is_err());
    }
}
