//! Collar cryptographic layer: a persistent Signal Protocol key store.
//!
//! This crate provides:
//! - Identity key management (Curve25519 via libsignal)
//! - Durable storage of prekeys, signed prekeys, sessions and pinned identities
//! - Per-server storage scopes
//! - Pre-key bundle generation and processing
//! - Pairwise session establishment (X3DH + Double Ratchet)
//! - `SignalCypher`, the session-backed `Cypher` used by the packet codec

pub mod error;
pub mod identity;
pub mod prekey;
pub mod scope;
pub mod session;
pub mod store;
mod stores;

// Re-export key types for convenience
pub use error::{CryptoError, KeyNamespace, StoreError};
pub use identity::{generate_identity_key_pair, protocol_address, SerializableIdentityKeyPair};
pub use prekey::{
    generate_next_pre_keys, generate_pre_keys, generate_signed_pre_key, local_bundle,
    next_pre_key_id, published_bundle, replenish_pre_keys, PublishedBundle, PublishedPreKey,
};
pub use scope::{HomeDirectory, ScopeResolver};
pub use session::{establish_session, SignalCypher};
pub use store::{
    FileStorage, IdentityKeys, KeyStore, MemoryStorage, PreKeys, RecordStorage, Sessions,
    SignedPreKeys,
};
