//! trialctl configuration, read from `trialctl.toml` unless `--config` says otherwise.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "trialctl.toml";

/// trialctl configuration (TOML).
///
/// Missing sections and fields fall back to defaults, so an absent file is a
/// valid configuration for everything except the API address.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrialctlConfig {
    pub api: ApiConfig,
    pub generator: GeneratorConfig,
    pub kubectl: KubectlConfig,
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the remote experiments API. Empty means "not configured".
    pub address: String,
    /// Bearer token sent with every request, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub timeout_secs: u64,
    /// Interval between activity feed polls.
    pub poll_interval_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: None,
            timeout_secs: 30,
            poll_interval_secs: 5,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads an Application on stdin and prints manifests.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate generator stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "generate-experiment".to_string(),
                "-f".to_string(),
                "-".to_string(),
            ],
            timeout_secs: 120,
            output_limit_bytes: 4 * 1024 * 1024,
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KubectlConfig {
    /// kubectl invocation prefix, e.g. `["kubectl", "--context", "lab"]`.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            command: vec!["kubectl".to_string()],
            timeout_secs: 60,
        }
    }
}

impl KubectlConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Capacity of the channel between the feed poller and the orchestrator.
    pub activity_buffer: usize,
    /// Capacity of the activity report channel.
    pub report_buffer: usize,
    pub bind: String,
    pub port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            activity_buffer: 16,
            report_buffer: 64,
            bind: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

impl TrialctlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api.timeout_secs == 0 {
            bail!("api.timeout_secs must be > 0");
        }
        if self.api.poll_interval_secs == 0 {
            bail!("api.poll_interval_secs must be > 0");
        }
        if self.generator.timeout_secs == 0 {
            bail!("generator.timeout_secs must be > 0");
        }
        if self.generator.output_limit_bytes == 0 {
            bail!("generator.output_limit_bytes must be > 0");
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            bail!("generator.command must be a non-empty array");
        }
        if self.kubectl.command.is_empty() || self.kubectl.command[0].trim().is_empty() {
            bail!("kubectl.command must be a non-empty array");
        }
        if self.kubectl.timeout_secs == 0 {
            bail!("kubectl.timeout_secs must be > 0");
        }
        if self.controller.activity_buffer == 0 || self.controller.report_buffer == 0 {
            bail!("controller channel buffers must be > 0");
        }
        Ok(())
    }

    /// Apply a command-line `--address` override.
    pub fn with_address(mut self, address: Option<String>) -> Self {
        if let Some(address) = address {
            self.api.address = address;
        }
        self
    }
}

/// Load and validate the config at `path`; a missing file yields defaults.
pub fn load_config(path: &Path) -> Result<TrialctlConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<TrialctlConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => TrialctlConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, TrialctlConfig::default());
        assert!(cfg.api.address.is_empty());
    }

    #[test]
    fn full_file_parses_every_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("trialctl.toml");
        fs::write(
            &path,
            r#"
[api]
address = "https://api.example.test"
token = "secret"
poll_interval_secs = 2

[generator]
command = ["/opt/bin/generate-experiment", "-f", "-"]

[kubectl]
command = ["kubectl", "--context", "lab"]
timeout_secs = 15

[controller]
port = 8088
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.api.token.as_deref(), Some("secret"));
        assert_eq!(cfg.api.poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.api.timeout_secs, 30);
        assert_eq!(cfg.generator.command[0], "/opt/bin/generate-experiment");
        assert_eq!(cfg.kubectl.timeout(), Duration::from_secs(15));
        assert_eq!(cfg.controller.port, 8088);
        assert_eq!(cfg.controller.bind, "127.0.0.1");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("trialctl.toml");
        fs::write(&path, "[api]\naddress = \"http://localhost:8080\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.api.address, "http://localhost:8080");
        assert_eq!(cfg.kubectl, KubectlConfig::default());
        assert_eq!(cfg.controller.port, 3001);
    }

    #[test]
    fn rejects_empty_generator_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("trialctl.toml");
        fs::write(&path, "[generator]\ncommand = []\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("generator.command"));
    }

    #[test]
    fn address_override_wins() {
        let cfg = TrialctlConfig::default().with_address(Some("http://override".to_string()));
        assert_eq!(cfg.api.address, "http://override");
        let cfg = cfg.with_address(None);
        assert_eq!(cfg.api.address, "http://override");
    }
}
