//! Device interface trait and common types
//!
//! Defines the abstract "query free/total memory per device" capability the
//! sampler is built on.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// NVIDIA GPU through NVML
    #[default]
    Nvidia,
    /// In-memory mock devices
    Mock,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Nvidia => write!(f, "nvidia"),
            DeviceType::Mock => write!(f, "mock"),
        }
    }
}

/// Unique identifier for a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Device index (0-based)
    pub index: u32,
    /// Device UUID (if available)
    pub uuid: Option<String>,
    /// Device name/model
    pub name: String,
}

impl DeviceId {
    /// Stable key used as the sample's device id: the UUID when known,
    /// otherwise `gpu-<index>`.
    pub fn key(&self) -> String {
        self.uuid
            .clone()
            .unwrap_or_else(|| format!("gpu-{}", self.index))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{}", self.index)
    }
}

/// Raw memory reading for one device, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
}

/// Errors that can occur during device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// NVML initialization failed
    #[error("Failed to initialize NVML: {0}")]
    NvmlInitError(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to query device
    #[error("Failed to query device: {0}")]
    QueryError(String),

    /// Reading violates free <= total or reports zero capacity
    #[error("Inconsistent memory reading on {device}: free={free} total={total}")]
    InconsistentReading { device: String, free: u64, total: u64 },
}

/// Device interface trait
///
/// Implementations should be thread-safe and async-compatible.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// List all devices the backend can see
    async fn list_devices(&self) -> Result<Vec<DeviceId>, DeviceError>;

    /// Query current free/total memory of a device
    async fn memory_info(&self, device: &DeviceId) -> Result<MemoryInfo, DeviceError>;

    /// Get the device type
    fn device_type(&self) -> DeviceType;
}
