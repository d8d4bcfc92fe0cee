//! Engine Configuration
//!
//! Settings shared by every execution the engine runs. Loaded from a YAML
//! or JSON file (every field optional), then overridden from the
//! environment:
//!
//! | Variable                   | Field            |
//! |----------------------------|------------------|
//! | `FLOWPILOT_MAX_CONCURRENT` | `max_concurrent` |
//! | `FLOWPILOT_DATA_DIR`       | `data_dir`       |
//! | `FLOWPILOT_TRACE`          | `trace_logging`  |

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::{BreakpointSettings, ExecutorOptions};

const ENV_PREFIX: &str = "FLOWPILOT";

/// Engine-wide settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the global worker pool shared by all batches
    pub max_concurrent: usize,
    /// Per-batch cap when a request omits `workers`
    pub default_workers: usize,
    /// Root of the batch store
    pub data_dir: PathBuf,
    pub trace_logging: bool,
    pub wait_poll_interval_ms: u64,
    pub breakpoints: BreakpointSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: num_cpus::get().max(1),
            default_workers: 2,
            data_dir: PathBuf::from(".flowpilot"),
            trace_logging: false,
            wait_poll_interval_ms: 100,
            breakpoints: BreakpointSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a config file; `.yaml`/`.yml` is parsed as YAML, anything
    /// else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        debug!("Loaded configuration from {}", path.display());

        config.validate()?;
        Ok(config)
    }

    /// Defaults or the given file, then environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let loader = EnvLoader { lookup };

        self.max_concurrent = loader.parsed("MAX_CONCURRENT", self.max_concurrent);
        self.trace_logging = loader.flag("TRACE", self.trace_logging);
        if let Some(dir) = loader.get("DATA_DIR").filter(|d| !d.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if self.default_workers == 0 {
            return Err(ConfigError::Invalid("default_workers must be at least 1".into()));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("wait_poll_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// Executor options every execution starts from.
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions::default()
            .with_breakpoints(self.breakpoints)
            .with_trace(self.trace_logging)
            .with_poll_interval(self.wait_poll_interval())
    }
}

struct EnvLoader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvLoader<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}_{}", ENV_PREFIX, key))
    }

    fn parsed<T: FromStr>(&self, key: &str, current: T) -> T {
        match self.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid {}_{}: '{}'", ENV_PREFIX, key, raw);
                current
            }),
            None => current,
        }
    }

    fn flag(&self, key: &str, current: bool) -> bool {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                warn!("Ignoring invalid {}_{}: '{}'", ENV_PREFIX, key, v);
                current
            }
            None => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::BreakpointCheckpoint;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent >= 1);
        assert_eq!(config.default_workers, 2);
        assert_eq!(config.data_dir, PathBuf::from(".flowpilot"));
        assert_eq!(config.wait_poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flowpilot.yaml");
        fs::write(
            &path,
            "max_concurrent: 3\nbreakpoints:\n  enabled: true\n  checkpoint: both\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.default_workers, 2);
        assert!(config.breakpoints.enabled);
        assert_eq!(config.breakpoints.checkpoint, BreakpointCheckpoint::Both);
    }

    #[test]
    fn test_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flowpilot.json");
        fs::write(&path, r#"{ "data_dir": "/var/lib/flowpilot", "trace_logging": true }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/flowpilot"));
        assert!(config.executor_options().trace_logging);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.yaml")),
            Err(ConfigError::Read { .. })
        ));

        let path = dir.path().join("zero.yaml");
        fs::write(&path, "max_concurrent: 0\n").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Invalid(_))));

        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup(&[
            ("FLOWPILOT_MAX_CONCURRENT", "7"),
            ("FLOWPILOT_DATA_DIR", "/tmp/fp"),
            ("FLOWPILOT_TRACE", "yes"),
        ]));

        assert_eq!(config.max_concurrent, 7);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/fp"));
        assert!(config.trace_logging);
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let mut config = EngineConfig::default();
        let before = config.clone();
        config.apply_overrides(lookup(&[
            ("FLOWPILOT_MAX_CONCURRENT", "many"),
            ("FLOWPILOT_TRACE", "maybe"),
            ("FLOWPILOT_DATA_DIR", "  "),
        ]));
        assert_eq!(config, before);
    }
}
