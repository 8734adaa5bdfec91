//! NVIDIA GPU device implementation
//!
//! Uses NVML (NVIDIA Management Library) for memory queries.

use std::sync::Arc;

use async_trait::async_trait;
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use tracing::trace;

use super::{DeviceError, DeviceId, DeviceInterface, DeviceType, MemoryInfo};

/// Global NVML instance
static NVML: OnceCell<Arc<Nvml>> = OnceCell::new();

/// Get or initialize the global NVML instance. A failed initialization is
/// retried on the next call.
fn get_nvml() -> Result<&'static Arc<Nvml>, DeviceError> {
    NVML.get_or_try_init(|| {
        Nvml::init()
            .map(Arc::new)
            .map_err(|e| DeviceError::NvmlInitError(e.to_string()))
    })
}

/// NVIDIA GPU device implementation
///
/// NVML is initialized lazily, so a node whose driver is missing or broken
/// reports a query error on every tick instead of refusing to start.
#[derive(Debug, Default)]
pub struct NvidiaDevice;

impl NvidiaDevice {
    /// Create a new NVIDIA device interface
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceInterface for NvidiaDevice {
    async fn list_devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        let nvml = get_nvml()?;
        let count = nvml
            .device_count()
            .map_err(|e| DeviceError::QueryError(e.to_string()))?;

        let mut devices = Vec::with_capacity(count as usize);

        for i in 0..count {
            let device = nvml
                .device_by_index(i)
                .map_err(|e| DeviceError::QueryError(e.to_string()))?;

            let name = device
                .name()
                .map_err(|e| DeviceError::QueryError(e.to_string()))?;

            let uuid = device.uuid().ok();

            devices.push(DeviceId {
                index: i,
                uuid,
                name,
            });
        }

        Ok(devices)
    }

    async fn memory_info(&self, device: &DeviceId) -> Result<MemoryInfo, DeviceError> {
        let nvml = get_nvml()?;
        let nvml_device = nvml
            .device_by_index(device.index)
            .map_err(|e| DeviceError::DeviceNotFound(e.to_string()))?;

        let memory = nvml_device.memory_info().map_err(|e| {
            DeviceError::QueryError(format!("Failed to get memory info: {}", e))
        })?;

        trace!(
            device = %device,
            total = memory.total,
            free = memory.free,
            "Device memory"
        );

        Ok(MemoryInfo {
            total: memory.total,
            free: memory.free,
        })
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Nvidia
    }
}
