//! Identity key generation and serialization.
//!
//! Each installation has a long-term Curve25519 identity key pair and a
//! registration id, generated the first time its store is opened and
//! persisted from then on.

use collar_protocol::Identity;
use libsignal_protocol::{IdentityKey, IdentityKeyPair, KeyPair, ProtocolAddress};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest registration id Signal clients hand out.
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// A serializable wrapper around libsignal's IdentityKeyPair.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableIdentityKeyPair {
    /// Serialized Curve25519 public key (type byte + 32 bytes).
    pub public_key: Vec<u8>,
    /// 32-byte Curve25519 private key.
    pub private_key: Vec<u8>,
}

impl SerializableIdentityKeyPair {
    /// Convert to libsignal's IdentityKeyPair.
    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair, libsignal_protocol::SignalProtocolError> {
        let key_pair = KeyPair::from_public_and_private(&self.public_key, &self.private_key)?;
        Ok(IdentityKeyPair::new(
            IdentityKey::new(key_pair.public_key),
            key_pair.private_key,
        ))
    }

    /// Create from a libsignal IdentityKeyPair.
    pub fn from_identity_key_pair(pair: &IdentityKeyPair) -> Self {
        Self {
            public_key: pair.public_key().serialize().to_vec(),
            private_key: pair.private_key().serialize().to_vec(),
        }
    }
}

/// Generate a fresh identity key pair.
pub fn generate_identity_key_pair() -> IdentityKeyPair {
    IdentityKeyPair::generate(&mut OsRng)
}

/// Generate a registration id in `1..=MAX_REGISTRATION_ID`.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}

/// Signal address for a peer identity.
pub fn protocol_address(identity: &Identity) -> ProtocolAddress {
    ProtocolAddress::new(identity.name.clone(), identity.device_id.into())
}
