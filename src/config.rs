//! Orchestrator settings
//!
//! Settings are read from a YAML file. Every field is optional; missing
//! fields take the defaults below.
//!
//! ```yaml
//! project: shop
//! health_interval: 30s
//! health_timeout: 30s
//! health_retries: 3
//! restart_delay: 1s
//! default_max_retries: 3
//! always_max_attempts: 10
//! stop_timeout: 10s
//! ```

use crate::compose::duration::serde_duration;
use crate::error::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up under the user config directory
pub const CONFIG_FILE: &str = "config.yaml";

/// Default capacity of the instance event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Project name used for instance ids when the stack file names none
    pub project: Option<String>,
    /// Probe interval when a healthcheck omits it
    #[serde(with = "serde_duration")]
    pub health_interval: Duration,
    /// Probe timeout when a healthcheck omits it
    #[serde(with = "serde_duration")]
    pub health_timeout: Duration,
    /// Probe retries when a healthcheck omits them
    pub health_retries: u32,
    /// Pause between restart attempts
    #[serde(with = "serde_duration")]
    pub restart_delay: Duration,
    /// Retry budget for `on-failure` without an explicit count
    pub default_max_retries: u32,
    /// Cap on start attempts under `always`; unbounded when unset
    pub always_max_attempts: Option<u32>,
    /// How long a single stop may take
    #[serde(with = "serde_duration")]
    pub stop_timeout: Duration,
    /// Capacity of the instance event channel
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            project: None,
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(30),
            health_retries: 3,
            restart_delay: Duration::from_secs(1),
            default_max_retries: 3,
            always_max_attempts: None,
            stop_timeout: Duration::from_secs(10),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            OrchestrationError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::debug!("Loaded orchestrator settings from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, else the user config file if it exists, else
    /// the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/runestack/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("runestack").join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_retries == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "health_retries must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(OrchestrationError::InvalidConfig(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.always_max_attempts == Some(0) {
            return Err(OrchestrationError::InvalidConfig(
                "always_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Probe settings applied to healthchecks that leave them out
    pub fn probe_defaults(&self) -> ProbeDefaults {
        ProbeDefaults {
            interval: self.health_interval,
            timeout: self.health_timeout,
            retries: self.health_retries,
        }
    }
}

/// Fallback probe settings for the stack loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDefaults {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        OrchestratorConfig::default().probe_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "restart_delay: 250ms\nalways_max_attempts: 4").unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.restart_delay, Duration::from_millis(250));
        assert_eq!(config.always_max_attempts, Some(4));
        assert_eq!(config.health_retries, 3);
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "health_retries: 0").unwrap();
        assert!(matches!(
            OrchestratorConfig::load(file.path()),
            Err(OrchestrationError::InvalidConfig(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "restart_delay: soon").unwrap();
        assert!(OrchestratorConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            OrchestratorConfig::load_or_default(Some(&missing)),
            Err(OrchestrationError::Io(_))
        ));
    }

    #[test]
    fn test_round_trips_through_yaml() {
        let config = OrchestratorConfig {
            project: Some("shop".into()),
            restart_delay: Duration::from_millis(1500),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("restart_delay: 1s500ms"));
        let back: OrchestratorConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, config);
    }
}
