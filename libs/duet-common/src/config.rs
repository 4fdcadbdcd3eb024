// Harness configuration shared by the host and the container runner
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the container listens on to receive the address of the host process.
pub const EXCHANGE_PORT: u16 = 2349;

pub const DEFAULT_CONFIG_PATH: &str = "config/harness.json";

/// Environment variable naming a directory for container logs.
pub const ARTIFACTS_DIR_ENV: &str = "TEST_UNDECLARED_OUTPUTS_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub image: String,
    pub runner_binary: String,
    pub exchange_port: u16,
    pub exchange_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub dial_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub capabilities: Vec<String>,
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            image: "duet-runner:latest".to_string(),
            runner_binary: "duet-runner".to_string(),
            exchange_port: EXCHANGE_PORT,
            exchange_timeout_ms: 10_000,
            run_timeout_ms: 10_000,
            dial_interval_ms: 200,
            poll_interval_ms: 250,
            capabilities: vec!["NET_ADMIN".to_string()],
            artifacts_dir: None,
        }
    }
}

/// Deadline and backoff for one retrying step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl HarnessConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Harness config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: HarnessConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(config)
    }

    /// Load from an explicit path, or from config/harness.json if it exists,
    /// then apply environment overrides and validate.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DUET_IMAGE`, `DUET_EXCHANGE_PORT` and the artifacts directory
    /// variable. Takes a lookup function so tests don't touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = lookup("DUET_IMAGE").filter(|v| !v.is_empty()) {
            self.image = image;
        }
        if let Some(port) = lookup("DUET_EXCHANGE_PORT").filter(|v| !v.is_empty()) {
            self.exchange_port = port
                .parse()
                .with_context(|| format!("Invalid DUET_EXCHANGE_PORT: {}", port))?;
        }
        if let Some(dir) = lookup(ARTIFACTS_DIR_ENV).filter(|v| !v.is_empty()) {
            self.artifacts_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("image cannot be empty");
        }
        if self.exchange_port == 0 {
            bail!("exchange_port must be a fixed, non-zero port");
        }
        if self.exchange_timeout_ms == 0 || self.run_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.dial_interval_ms == 0 || self.poll_interval_ms == 0 {
            bail!("retry intervals must be greater than zero");
        }
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Policy for dialing the container's exchange listener.
    pub fn dial_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.exchange_timeout(),
            interval: Duration::from_millis(self.dial_interval_ms),
        }
    }

    /// Policy for polling the container's reported address.
    pub fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.exchange_timeout(),
            interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.exchange_port, 2349);
        assert_eq!(config.exchange_timeout(), Duration::from_secs(10));
        assert_eq!(config.dial_policy().interval, Duration::from_millis(200));
        assert_eq!(config.poll_policy().interval, Duration::from_millis(250));
        assert_eq!(config.capabilities, vec!["NET_ADMIN".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        fs::write(&path, r#"{ "image": "custom:1", "run_timeout_ms": 3000 }"#).unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.image, "custom:1");
        assert_eq!(config.run_timeout(), Duration::from_secs(3));
        assert_eq!(config.exchange_port, EXCHANGE_PORT);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = HarnessConfig::load(Path::new("/nonexistent/harness.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DUET_IMAGE", "other:latest"),
            ("DUET_EXCHANGE_PORT", "4000"),
            (ARTIFACTS_DIR_ENV, "/tmp/artifacts"),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.image, "other:latest");
        assert_eq!(config.exchange_port, 4000);
        assert_eq!(config.artifacts_dir, Some(PathBuf::from("/tmp/artifacts")));
    }

    #[test]
    fn test_invalid_port_override() {
        let mut config = HarnessConfig::default();
        let result = config.apply_env(|key| (key == "DUET_EXCHANGE_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = HarnessConfig {
            dial_interval_ms: 0,
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
