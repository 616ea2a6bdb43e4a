/// MTU reported while no negotiation is supported. This is the BLE default payload size.
pub const DEFAULT_MTU: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    #[inline]
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingStatus {
    Paired,
    NotPaired,
}

/// Terminal result of a native pairing handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingOutcome {
    Paired,
    AlreadyPaired,
    NotReadyToPair,
    Rejected,
    Failed,
    /// The platform has no pairing primitive.
    Unsupported,
}

impl PairingOutcome {
    /// Only an explicit `Paired` counts as success.
    #[inline]
    pub fn is_paired(self) -> bool {
        self == PairingOutcome::Paired
    }
}

/// Protection level requested from the native pairing handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtectionLevel {
    #[default]
    None,
    Encryption,
    EncryptionAndAuthentication,
}
