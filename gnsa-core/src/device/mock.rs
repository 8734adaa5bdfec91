//! Mock device implementation for testing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{DeviceError, DeviceId, DeviceInterface, DeviceType, MemoryInfo};

const GIB: u64 = 1024 * 1024 * 1024;

/// Mock device for testing
pub struct MockDevice {
    devices: RwLock<Vec<(DeviceId, MemoryInfo)>>,
    /// Configurable query failure simulation
    pub fail_queries: AtomicBool,
}

impl MockDevice {
    /// Create a new mock device with default 2 GPUs (16GB total, 12GB free)
    pub fn new() -> Self {
        Self::with_device_count(2)
    }

    /// Create a mock device with specified number of GPUs
    pub fn with_device_count(count: u32) -> Self {
        Self::with_memory(
            &(0..count)
                .map(|_| (16 * GIB, 12 * GIB))
                .collect::<Vec<_>>(),
        )
    }

    /// Create a mock device with one GPU per `(total, free)` pair
    pub fn with_memory(memory: &[(u64, u64)]) -> Self {
        let devices = memory
            .iter()
            .enumerate()
            .map(|(i, &(total, free))| {
                (
                    DeviceId {
                        index: i as u32,
                        uuid: Some(format!("GPU-MOCK-{:04}", i)),
                        name: format!("Mock GPU {}", i),
                    },
                    MemoryInfo { total, free },
                )
            })
            .collect();

        Self {
            devices: RwLock::new(devices),
            fail_queries: AtomicBool::new(false),
        }
    }

    /// Set whether queries should fail
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the memory reading of a device
    pub fn set_memory(&self, index: u32, total: u64, free: u64) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        if let Some((_, info)) = devices.iter_mut().find(|(id, _)| id.index == index) {
            *info = MemoryInfo { total, free };
        }
    }

    /// Drop every device, as if all GPUs fell off the bus
    pub fn remove_all(&self) {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInterface for MockDevice {
    async fn list_devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(DeviceError::QueryError("mock query failure".to_string()));
        }
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        Ok(devices.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn memory_info(&self, device: &DeviceId) -> Result<MemoryInfo, DeviceError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(DeviceError::QueryError("mock query failure".to_string()));
        }
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices
            .iter()
            .find(|(id, _)| id.index == device.index)
            .map(|(_, info)| *info)
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("Device {} not found", device.index)))
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_device_list() {
        let mock = MockDevice::with_device_count(4);
        let devices = mock.list_devices().await.unwrap();
        assert_eq!(devices.len(), 4);
    }

    #[tokio::test]
    async fn test_mock_set_memory() {
        let mock = MockDevice::new();
        mock.set_memory(1, 8 * GIB, GIB);
        let devices = mock.list_devices().await.unwrap();
        let info = mock.memory_info(&devices[1]).await.unwrap();
        assert_eq!(info, MemoryInfo { total: 8 * GIB, free: GIB });
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let mock = MockDevice::new();
        mock.set_fail_queries(true);
        assert!(mock.list_devices().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_remove_all() {
        let mock = MockDevice::new();
        mock.remove_all();
        assert!(mock.list_devices().await.unwrap().is_empty());
    }
}
