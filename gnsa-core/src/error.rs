//! Error taxonomy shared across the agent

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::device::DeviceError;

/// Startup configuration errors. Any of these aborts the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No node identity configured
    #[error("node name must be set via config, --node-name, or NODE_NAME")]
    MissingNodeName,

    /// No policy mode configured
    #[error("policy mode must be set via config, --mode, or MODE")]
    MissingMode,

    /// Unrecognised policy mode
    #[error("unknown policy mode {0:?} (expected MaxFreeMemory or MeanFreeMemory)")]
    UnknownMode(String),

    /// No visible device mask configured
    #[error("visible devices must be set via config, --visible-devices, or NVIDIA_VISIBLE_DEVICES")]
    MissingDeviceMask,

    /// Malformed NVIDIA_VISIBLE_DEVICES value
    #[error("invalid visible device mask: {0}")]
    InvalidDeviceMask(String),

    /// Thresholds out of range
    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),
}

/// A failure contained within a single tick
#[derive(Debug, Error)]
pub enum TickError {
    #[error("sampling failed: {0}")]
    Sample(#[from] DeviceError),

    #[error("node action failed: {0}")]
    Execute(#[from] ClusterError),
}

impl TickError {
    /// Label used for the tick failure metric
    pub fn stage(&self) -> &'static str {
        match self {
            TickError::Sample(_) => "sample",
            TickError::Execute(_) => "execute",
        }
    }
}
