//! Device abstraction layer
//!
//! Provides a unified memory-query interface over GPU backends.

mod interface;
mod mock;
mod nvidia;

pub use interface::*;
pub use mock::MockDevice;
pub use nvidia::NvidiaDevice;

use std::sync::Arc;

/// Create a device interface based on the device type.
///
/// `mock_memory` seeds the mock backend with `(total, free)` byte pairs and is
/// ignored for NVIDIA.
pub fn create_device_interface(
    device_type: DeviceType,
    mock_memory: &[(u64, u64)],
) -> Arc<dyn DeviceInterface> {
    match device_type {
        DeviceType::Nvidia => Arc::new(NvidiaDevice::new()),
        DeviceType::Mock => {
            tracing::warn!(devices = mock_memory.len(), "Using mock GPU devices");
            Arc::new(MockDevice::with_memory(mock_memory))
        }
    }
}
