use std::fmt;

use serde::{Deserialize, Serialize};

/// Device id used when a participant only ever runs one installation.
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// Cryptographic address of a participant: a stable name plus a device
/// discriminator, optionally bound to the identity public key we know for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub device_id: u32,
    /// Serialized identity public key, when known.
    #[serde(default)]
    pub public_key: Option<Vec<u8>>,
}

impl Identity {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, public_key: impl Into<Vec<u8>>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_name_dot_device() {
        let id = Identity::new("alice", 3);
        assert_eq!(id.to_string(), "alice.3");
    }

    #[test]
    fn public_key_does_not_change_address() {
        let bare = Identity::new("bob", DEFAULT_DEVICE_ID);
        let keyed = bare.clone().with_public_key(vec![5u8; 33]);
        assert_eq!(bare.to_string(), keyed.to_string());
        assert_ne!(bare, keyed);
    }
}
