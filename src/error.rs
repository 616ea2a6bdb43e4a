use crate::common::PairingOutcome;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform could not resolve a link for the identifier.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The pairing handshake finished without reporting `Paired`.
    #[error("Pairing to device failed - {0:?}")]
    PairingFailed(PairingOutcome),

    #[error("Operation is not implemented: {0}")]
    NotImplemented(&'static str),

    /// The operation needs a native link and there is none.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Enumerating the services of the connected device failed.
    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),
}
