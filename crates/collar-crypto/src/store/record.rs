use std::fmt;

use libsignal_protocol::ProtocolAddress;

use crate::error::KeyNamespace;

/// Which address-keyed record family a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Session,
    TrustedIdentity,
}

/// Address of one persisted record. Also the unit of locking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    IdentityKeyPair,
    RegistrationId,
    /// Counter the next one-time prekey id is allocated from.
    NextPreKeyId,
    PreKey(u32),
    SignedPreKey(u32),
    Session { name: String, device_id: u32 },
    TrustedIdentity { name: String, device_id: u32 },
}

impl RecordKey {
    pub fn key_id(namespace: KeyNamespace, id: u32) -> Self {
        match namespace {
            KeyNamespace::PreKey => Self::PreKey(id),
            KeyNamespace::SignedPreKey => Self::SignedPreKey(id),
        }
    }

    pub fn address(kind: AddressKind, name: &str, device_id: u32) -> Self {
        let name = name.to_owned();
        match kind {
            AddressKind::Session => Self::Session { name, device_id },
            AddressKind::TrustedIdentity => Self::TrustedIdentity { name, device_id },
        }
    }

    pub fn session(address: &ProtocolAddress) -> Self {
        Self::address(
            AddressKind::Session,
            address.name(),
            u32::from(address.device_id()),
        )
    }

    pub fn trusted_identity(address: &ProtocolAddress) -> Self {
        Self::address(
            AddressKind::TrustedIdentity,
            address.name(),
            u32::from(address.device_id()),
        )
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityKeyPair => f.write_str("identity key pair"),
            Self::RegistrationId => f.write_str("registration id"),
            Self::NextPreKeyId => f.write_str("next prekey id"),
            Self::PreKey(id) => write!(f, "prekey {id}"),
            Self::SignedPreKey(id) => write!(f, "signed prekey {id}"),
            Self::Session { name, device_id } => write!(f, "session {name}.{device_id}"),
            Self::TrustedIdentity { name, device_id } => {
                write!(f, "identity {name}.{device_id}")
            }
        }
    }
}
