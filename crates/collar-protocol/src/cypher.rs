//! The encryption capability consumed by the packet codec.
//!
//! The codec never touches ratchet state itself; it hands serialized bytes
//! to a `Cypher` keyed by the peer's identity and frames whatever comes back.

use thiserror::Error;

use crate::identity::Identity;

#[derive(Debug, Error)]
pub enum CypherError {
    #[error("no session established with {0}")]
    NoSession(Identity),

    #[error("identity for {0} is not trusted")]
    Untrusted(Identity),

    #[error("{0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CypherError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}

/// Encrypts and decrypts payloads using the session established with an identity.
///
/// Implementations mutate session state on every call, so they are expected
/// to serialize calls for the same identity internally.
pub trait Cypher {
    fn encrypt(&self, recipient: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CypherError>;

    fn decrypt(&self, sender: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CypherError>;
}

impl<C: Cypher + ?Sized> Cypher for &C {
    fn encrypt(&self, recipient: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CypherError> {
        (**self).encrypt(recipient, plaintext)
    }

    fn decrypt(&self, sender: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CypherError> {
        (**self).decrypt(sender, ciphertext)
    }
}

impl<C: Cypher + ?Sized> Cypher for std::sync::Arc<C> {
    fn encrypt(&self, recipient: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CypherError> {
        (**self).encrypt(recipient, plaintext)
    }

    fn decrypt(&self, sender: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CypherError> {
        (**self).decrypt(sender, ciphertext)
    }
}
