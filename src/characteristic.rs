use uuid::Uuid;

/// A characteristic exposed by a discovered [`Service`](crate::Service).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub(crate) service: Uuid,
    pub(crate) uuid: Uuid,
}

impl Characteristic {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// UUID of the service that contains this characteristic
    pub fn service_uuid(&self) -> Uuid {
        self.service
    }
}
