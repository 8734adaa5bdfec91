//! Configuration module for GNSA
//!
//! Handles loading and validating configuration from YAML files. CLI flags and
//! their environment variables are layered on top in `main`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gnsa_core::cluster::NodeIdentity;
use gnsa_core::device::DeviceType;
use gnsa_core::error::ConfigError;
use gnsa_core::executor::ExecutorConfig;
use gnsa_core::policy::{PolicyMode, Thresholds};
use gnsa_core::sampler::VisibleDeviceMask;

/// One mock GPU, used when `device_type: mock`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockDeviceConfig {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Unhealthy-node thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    /// Free bytes below which every device counts as low on memory
    #[serde(default = "default_cordon_floor")]
    pub cordon_floor_bytes: u64,

    /// Free bytes below which every device counts as exhausted
    #[serde(default = "default_delete_floor")]
    pub delete_floor_bytes: u64,

    /// Consecutive ticks before a condition escalates
    #[serde(default = "default_debounce_ticks")]
    pub debounce_ticks: u32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cordon_floor_bytes: default_cordon_floor(),
            delete_floor_bytes: default_delete_floor(),
            debounce_ticks: default_debounce_ticks(),
        }
    }
}

impl From<&ThresholdsConfig> for Thresholds {
    fn from(config: &ThresholdsConfig) -> Self {
        Thresholds {
            cordon_floor_bytes: config.cordon_floor_bytes,
            delete_floor_bytes: config.delete_floor_bytes,
            debounce_ticks: config.debounce_ticks,
        }
    }
}

/// Node action configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Timeout applied to every cluster API call
    #[serde(with = "humantime_serde", default = "default_api_timeout")]
    pub api_timeout: Duration,

    /// Whether Delete verdicts may remove the node object
    #[serde(default = "default_true")]
    pub allow_delete: bool,

    /// Publish score/mode/condition labels on the node
    #[serde(default = "default_true")]
    pub publish_score: bool,

    /// Prefix of the published labels
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Cap on ticks skipped after repeated transient API failures
    #[serde(default = "default_max_backoff_ticks")]
    pub max_backoff_ticks: u32,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            api_timeout: default_api_timeout(),
            allow_delete: true,
            publish_score: true,
            label_prefix: default_label_prefix(),
            max_backoff_ticks: default_max_backoff_ticks(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device backend
    #[serde(default)]
    pub device_type: DeviceType,

    /// Mock devices, only read for `device_type: mock`
    #[serde(default = "default_mock_devices")]
    pub mock_devices: Vec<MockDeviceConfig>,

    /// Node name (from K8s downward API)
    #[serde(default)]
    pub node_name: Option<String>,

    /// Policy mode name, required
    #[serde(default)]
    pub mode: Option<String>,

    /// Visible device mask, same syntax as NVIDIA_VISIBLE_DEVICES, required
    #[serde(default)]
    pub visible_devices: Option<String>,

    /// Tick interval
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub executor: ExecutorSection,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Dry run mode - log node actions but don't execute
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            mock_devices: default_mock_devices(),
            node_name: None,
            mode: None,
            visible_devices: None,
            interval: default_interval(),
            thresholds: ThresholdsConfig::default(),
            executor: ExecutorSection::default(),
            metrics: MetricsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            anyhow::bail!("interval must be > 0");
        }
        if self.executor.api_timeout.is_zero() {
            anyhow::bail!("executor.api_timeout must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        if self.device_type == DeviceType::Mock && self.mock_devices.is_empty() {
            anyhow::bail!("mock_devices must not be empty when device_type is mock");
        }
        self.thresholds().validate()?;
        self.executor_config().validate()?;
        Ok(())
    }

    pub fn node_identity(&self) -> Result<NodeIdentity, ConfigError> {
        NodeIdentity::new(self.node_name.clone().unwrap_or_default())
    }

    pub fn policy_mode(&self) -> Result<PolicyMode, ConfigError> {
        self.mode
            .as_deref()
            .ok_or(ConfigError::MissingMode)?
            .parse()
    }

    pub fn device_mask(&self) -> Result<VisibleDeviceMask, ConfigError> {
        VisibleDeviceMask::from_env_value(self.visible_devices.as_deref())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from(&self.thresholds)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            allow_delete: self.executor.allow_delete,
            publish_score: self.executor.publish_score,
            label_prefix: self.executor.label_prefix.clone(),
            max_backoff_ticks: self.executor.max_backoff_ticks,
            dry_run: self.dry_run,
        }
    }

    /// `(total, free)` pairs for the mock backend
    pub fn mock_memory(&self) -> Vec<(u64, u64)> {
        self.mock_devices
            .iter()
            .map(|d| (d.total_bytes, d.free_bytes))
            .collect()
    }
}

// Default value functions
fn default_cordon_floor() -> u64 {
    1024 * 1024 * 1024
}

fn default_delete_floor() -> u64 {
    256 * 1024 * 1024
}

fn default_debounce_ticks() -> u32 {
    3
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_label_prefix() -> String {
    "gnsa.io".to_string()
}

fn default_max_backoff_ticks() -> u32 {
    8
}

fn default_mock_devices() -> Vec<MockDeviceConfig> {
    vec![
        MockDeviceConfig {
            total_bytes: 16 * 1024 * 1024 * 1024,
            free_bytes: 12 * 1024 * 1024 * 1024,
        };
        2
    ]
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}
