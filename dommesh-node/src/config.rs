//! Configuration management for the Node Daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use dommesh_engine::{HardwareCategory, Host, HostSnapshot, Params, PollSettings, ACTION_TIMEOUT};

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dommesh/node.yaml";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-specific configuration
    pub node: NodeConfig,
    /// Cluster membership
    pub cluster: ClusterConfig,
    /// Poll loop tuning
    pub polling: PollingConfig,
    /// Snapshot/command backend
    pub backend: BackendConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.node.log_level = level.clone();
        }

        if args.log_json {
            self.node.log_format = LogFormat::Json;
        }

        if let Some(secs) = args.poll_interval {
            self.polling.periodic_interval_secs = secs;
        }

        if let Some(ref name) = args.node_name {
            self.node.name = Some(name.clone());
        }

        self
    }

    /// Check the configuration for values the daemon cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.node.log_level.to_lowercase().as_str()) {
            return Err(invalid(
                "node.log_level",
                format!("must be one of: {:?}", valid_levels),
            ));
        }

        if self.cluster.hosts.is_empty() {
            return Err(invalid("cluster.hosts", "at least one host is required"));
        }

        let mut names = HashSet::new();
        for host in &self.cluster.hosts {
            if host.name.trim().is_empty() {
                return Err(invalid("cluster.hosts", "host name must not be empty"));
            }
            if !names.insert(host.name.as_str()) {
                return Err(invalid(
                    "cluster.hosts",
                    format!("host {} is listed twice", host.name),
                ));
            }
        }

        if self.polling.interval_ms == 0 {
            return Err(invalid("polling.interval_ms", "must be greater than 0"));
        }
        if self.polling.action_timeout == 0 {
            return Err(invalid("polling.action_timeout", "must be greater than 0"));
        }
        if self.polling.periodic_interval_secs == 0 {
            return Err(invalid(
                "polling.periodic_interval_secs",
                "must be greater than 0",
            ));
        }

        let mut domains = HashSet::new();
        for domain in &self.backend.domains {
            if !domains.insert(domain.name.as_str()) {
                return Err(invalid(
                    "backend.domains",
                    format!("domain {} is listed twice", domain.name),
                ));
            }
            for placement in &domain.placements {
                if !names.contains(placement.host.as_str()) {
                    return Err(invalid(
                        "backend.domains",
                        format!(
                            "domain {} is placed on unknown host {}",
                            domain.name, placement.host
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Poll settings handed to every orchestrator.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.polling.interval_ms),
            action_timeout: self.polling.action_timeout,
        }
    }

    /// Pause between two periodic update passes.
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.polling.periodic_interval_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Node-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (auto-detected if not set)
    pub name: Option<String>,
    /// Log level
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl NodeConfig {
    /// Get the node name, detecting the hostname if not set.
    pub fn get_name(&self) -> String {
        self.name.clone().unwrap_or_else(local_hostname)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Cluster membership.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Hosts in iteration order; the first host wins field conflicts
    pub hosts: Vec<Host>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: vec![Host::new(local_hostname())],
        }
    }
}

/// Poll loop tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Pause between two transition poll iterations, in milliseconds
    pub interval_ms: u64,
    /// Transition poll iterations before giving up
    pub action_timeout: u32,
    /// Pause between two periodic update passes, in seconds
    pub periodic_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            action_timeout: ACTION_TIMEOUT,
            periodic_interval_secs: 5,
        }
    }
}

/// Backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-memory cluster for testing/development
    #[default]
    Mock,
}

/// Snapshot/command backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend type
    pub kind: BackendKind,
    /// Domains the mock backend starts with
    pub domains: Vec<SeedDomain>,
}

/// A domain preloaded into the mock backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedDomain {
    pub name: String,
    #[serde(default)]
    pub params: Params,
    /// Hosts the domain is defined on
    #[serde(default)]
    pub placements: Vec<SeedPlacement>,
    #[serde(default)]
    pub devices: Vec<SeedDevice>,
}

/// Where a seeded domain lives and in which state.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedPlacement {
    pub host: String,
    #[serde(default)]
    pub state: SeedState,
}

/// Initial power state of a seeded domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedState {
    #[default]
    Stopped,
    Running,
    Suspended,
}

/// A device of a seeded domain.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedDevice {
    pub category: HardwareCategory,
    pub key: String,
    #[serde(default)]
    pub params: Params,
}

impl SeedDomain {
    /// Snapshot the mock backend reports for one placement.
    pub fn snapshot(&self, placement: &SeedPlacement) -> HostSnapshot {
        let mut snapshot = HostSnapshot {
            running: placement.state != SeedState::Stopped,
            suspended: placement.state == SeedState::Suspended,
            params: self.params.clone(),
            ..HostSnapshot::defined()
        };
        for device in &self.devices {
            let mut params = device.params.clone();
            params
                .entry(device.category.descriptor().key_param.to_string())
                .or_insert_with(|| device.key.clone());
            snapshot = snapshot.with_device(device.category, device.key.clone(), params);
        }
        snapshot
    }
}
