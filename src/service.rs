use std::fmt;

use uuid::Uuid;

use crate::device::WeakDevice;
use crate::platform::ServiceHandle;
use crate::{Characteristic, Device};

/// A GATT service discovered on a connected device.
#[derive(Clone)]
pub struct Service {
    pub(crate) device: WeakDevice,
    pub(crate) service: ServiceHandle,
}

impl Service {
    pub(crate) fn new(device: WeakDevice, service: ServiceHandle) -> Self {
        Self { device, service }
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.service
            .characteristics
            .iter()
            .map(|uuid| Characteristic {
                service: self.service.uuid,
                uuid: *uuid,
            })
            .collect::<Vec<_>>()
    }

    pub fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.service.primary
    }

    /// The device this service was discovered on, if it is still alive.
    pub fn device(&self) -> Option<Device> {
        self.device.upgrade()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.service.uuid)
            .field("primary", &self.service.primary)
            .field("characteristics", &self.service.characteristics)
            .finish()
    }
}
