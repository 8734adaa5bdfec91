//! Device Sampler
//!
//! Produces one [`SampleSet`] per tick from the devices made visible by the
//! `NVIDIA_VISIBLE_DEVICES`-style mask.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::device::{DeviceError, DeviceId, DeviceInterface, MemoryInfo};
use crate::error::ConfigError;

static MASK_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+|GPU-[0-9A-Za-z][0-9A-Za-z-]*)$").expect("valid mask entry regex")
});

/// Configured device-visibility scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisibleDeviceMask {
    /// Every device the backend reports
    All,
    /// No device is visible
    None,
    /// Explicit device indices and/or UUIDs
    List(Vec<String>),
}

impl VisibleDeviceMask {
    /// Parse the mask from an optional environment value. Unset is a startup
    /// error; only an explicit `void`/`none`/empty value hides every device.
    pub fn from_env_value(value: Option<&str>) -> Result<Self, ConfigError> {
        match value {
            Some(v) => v.parse(),
            None => Err(ConfigError::MissingDeviceMask),
        }
    }

    /// Whether the mask admits the given device.
    ///
    /// The container runtime applies index entries itself and renumbers the
    /// devices it exposes from 0, so any index entry admits every enumerated
    /// device. UUID entries are matched against the device UUID.
    pub fn admits(&self, device: &DeviceId) -> bool {
        match self {
            VisibleDeviceMask::All => true,
            VisibleDeviceMask::None => false,
            VisibleDeviceMask::List(entries) => {
                entries.iter().any(|e| !is_uuid(e))
                    || entries.iter().any(|e| uuid_matches(e, device))
            }
        }
    }

    /// UUID entries that match none of `devices`
    pub fn missing_uuids<'a>(&'a self, devices: &[DeviceId]) -> Vec<&'a str> {
        match self {
            VisibleDeviceMask::List(entries) => entries
                .iter()
                .filter(|e| is_uuid(e) && !devices.iter().any(|d| uuid_matches(e, d)))
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn is_uuid(entry: &str) -> bool {
    entry.starts_with("GPU-")
}

fn uuid_matches(entry: &str, device: &DeviceId) -> bool {
    device.uuid.as_deref() == Some(entry)
}

impl FromStr for VisibleDeviceMask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "all" => return Ok(VisibleDeviceMask::All),
            "" | "void" | "none" => return Ok(VisibleDeviceMask::None),
            _ => {}
        }

        let mut entries: Vec<String> = Vec::new();
        for raw in trimmed.split(',') {
            let entry = raw.trim();
            if entry.starts_with("MIG-") {
                return Err(ConfigError::InvalidDeviceMask(format!(
                    "MIG device {:?} is not supported, list the parent GPU instead",
                    entry
                )));
            }
            if !MASK_ENTRY.is_match(entry) {
                return Err(ConfigError::InvalidDeviceMask(format!(
                    "invalid entry {:?} in {:?}",
                    entry, s
                )));
            }
            if !entries.iter().any(|e| e == entry) {
                entries.push(entry.to_string());
            }
        }
        Ok(VisibleDeviceMask::List(entries))
    }
}

impl fmt::Display for VisibleDeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisibleDeviceMask::All => write!(f, "all"),
            VisibleDeviceMask::None => write!(f, "none"),
            VisibleDeviceMask::List(entries) => write!(f, "{}", entries.join(",")),
        }
    }
}

/// One device's memory reading within a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSample {
    device_id: String,
    index: u32,
    total_memory_bytes: u64,
    free_memory_bytes: u64,
    sampled_at: DateTime<Utc>,
}

impl DeviceSample {
    /// Build a sample, rejecting readings with `free > total` or zero capacity
    pub fn new(
        device: &DeviceId,
        info: MemoryInfo,
        sampled_at: DateTime<Utc>,
    ) -> Result<Self, DeviceError> {
        if info.total == 0 || info.free > info.total {
            return Err(DeviceError::InconsistentReading {
                device: device.key(),
                free: info.free,
                total: info.total,
            });
        }
        Ok(Self {
            device_id: device.key(),
            index: device.index,
            total_memory_bytes: info.total,
            free_memory_bytes: info.free,
            sampled_at,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn total_memory_bytes(&self) -> u64 {
        self.total_memory_bytes
    }

    pub fn free_memory_bytes(&self) -> u64 {
        self.free_memory_bytes
    }

    pub fn sampled_at(&self) -> DateTime<Utc> {
        self.sampled_at
    }

    /// Free memory as a fraction of total, in `[0, 1]`
    pub fn free_ratio(&self) -> f64 {
        self.free_memory_bytes as f64 / self.total_memory_bytes as f64
    }
}

/// All device samples captured in one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleSet {
    node_name: String,
    visible_device_mask: VisibleDeviceMask,
    sampled_at: DateTime<Utc>,
    samples: Vec<DeviceSample>,
}

impl SampleSet {
    /// Build a sample set from raw readings, stamping every sample with the
    /// same tick timestamp.
    pub fn from_readings(
        node_name: impl Into<String>,
        visible_device_mask: VisibleDeviceMask,
        sampled_at: DateTime<Utc>,
        readings: Vec<(DeviceId, MemoryInfo)>,
    ) -> Result<Self, DeviceError> {
        let samples = readings
            .iter()
            .map(|(device, info)| DeviceSample::new(device, *info, sampled_at))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            node_name: node_name.into(),
            visible_device_mask,
            sampled_at,
            samples,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn visible_device_mask(&self) -> &VisibleDeviceMask {
        &self.visible_device_mask
    }

    pub fn sampled_at(&self) -> DateTime<Utc> {
        self.sampled_at
    }

    pub fn samples(&self) -> &[DeviceSample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Reads per-device memory statistics for the visible device set
pub struct DeviceSampler {
    device: Arc<dyn DeviceInterface>,
    node_name: String,
}

impl DeviceSampler {
    /// Create a new sampler for the given node
    pub fn new(device: Arc<dyn DeviceInterface>, node_name: impl Into<String>) -> Self {
        Self {
            device,
            node_name: node_name.into(),
        }
    }

    /// Sample every device admitted by `mask`.
    ///
    /// Fails if the backend cannot be queried, if a listed GPU UUID is not
    /// enumerated, or if any reading is inconsistent.
    pub async fn sample(&self, mask: &VisibleDeviceMask) -> Result<SampleSet, DeviceError> {
        let sampled_at = Utc::now();

        if *mask == VisibleDeviceMask::None {
            debug!("Device mask hides every device");
            return SampleSet::from_readings(&self.node_name, mask.clone(), sampled_at, Vec::new());
        }

        let devices = self.device.list_devices().await?;

        let missing = mask.missing_uuids(&devices);
        if !missing.is_empty() {
            return Err(DeviceError::DeviceNotFound(missing.join(",")));
        }

        let visible: Vec<DeviceId> = devices.into_iter().filter(|d| mask.admits(d)).collect();

        let mut readings = Vec::with_capacity(visible.len());
        for device in visible {
            let info = self.device.memory_info(&device).await?;
            readings.push((device, info));
        }

        trace!(count = readings.len(), "Sampled device memory");

        SampleSet::from_readings(&self.node_name, mask.clone(), sampled_at, readings)
    }
}
