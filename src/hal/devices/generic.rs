use std::sync::Arc;

use crate::hal::registry::{DeviceKind, DeviceKindRegistration, DEFAULT_LOCATION};

/// Device without a vendor layout. Sensor labels are matched against the
/// channel kind tags themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericDevice;

impl GenericDevice {
    pub const CLASS_NAME: &'static str = "Device";
}

impl DeviceKind for GenericDevice {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }
}

fn kind() -> Arc<dyn DeviceKind> {
    Arc::new(GenericDevice)
}

inventory::submit! {
    DeviceKindRegistration {
        location: DEFAULT_LOCATION,
        factory: kind,
    }
}
