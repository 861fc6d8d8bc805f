//! Pairwise session establishment and message encryption/decryption.
//!
//! Uses X3DH key agreement to establish sessions, then the Double Ratchet
//! algorithm for ongoing message encryption with forward secrecy.
//!
//! libsignal's store traits are async, but every store here completes
//! immediately, so the futures are driven with `block_on` under the
//! session lock of the peer address.

use std::sync::Arc;
use std::time::SystemTime;

use collar_protocol::{Cypher, CypherError, Identity};
use futures::executor::block_on;
use libsignal_protocol::{
    message_decrypt, message_decrypt_prekey, message_encrypt, process_prekey_bundle,
    CiphertextMessage, CiphertextMessageType, PreKeyBundle, PreKeySignalMessage, ProtocolAddress,
    SignalMessage, SignalProtocolError,
};
use rand::rngs::OsRng;
use tracing::{debug, info};

use crate::error::CryptoError;
use crate::identity::protocol_address;
use crate::store::KeyStore;
use crate::stores::{SignalStores, StoreContext};

/// Header value for a PreKey (session-initiating) message.
pub const MESSAGE_TYPE_PREKEY: u32 = 3;
/// Header value for a Whisper (established session) message.
pub const MESSAGE_TYPE_WHISPER: u32 = 2;

const TYPE_HEADER_LEN: usize = 4;

/// Process a remote pre-key bundle to establish a session with `address`.
///
/// The peer's identity key must already be pinned in `store`.
pub fn establish_session(
    store: &KeyStore,
    address: &ProtocolAddress,
    bundle: &PreKeyBundle,
) -> Result<(), CryptoError> {
    store.with_session_lock(address, || {
        let ctx = StoreContext::new(store);
        let mut stores = SignalStores::new(&ctx);
        let result = block_on(process_prekey_bundle(
            address,
            &mut stores.session,
            &mut stores.identity,
            bundle,
            SystemTime::now(),
            &mut OsRng,
        ));
        ctx.finish(result)
    })?;

    info!(%address, "established session");
    Ok(())
}

/// A [`Cypher`] backed by libsignal sessions in a [`KeyStore`].
///
/// Ciphertexts are framed as `[message type: u32 BE][serialized message]`.
#[derive(Clone)]
pub struct SignalCypher {
    store: Arc<KeyStore>,
}

impl SignalCypher {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    /// Encrypt for an address with an established session.
    pub fn encrypt_for(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let store = self.store.as_ref();
        let message = store.with_session_lock(address, || {
            let ctx = StoreContext::new(store);
            let mut stores = SignalStores::new(&ctx);
            let result = block_on(message_encrypt(
                plaintext,
                address,
                &mut stores.session,
                &mut stores.identity,
                SystemTime::now(),
            ));
            ctx.finish(result)
        })?;

        let message_type = match message.message_type() {
            CiphertextMessageType::PreKey => MESSAGE_TYPE_PREKEY,
            CiphertextMessageType::Whisper => MESSAGE_TYPE_WHISPER,
            other => return Err(CryptoError::UnknownMessageType(u32::from(other as u8))),
        };
        let body = message.serialize();

        let mut framed = Vec::with_capacity(TYPE_HEADER_LEN + body.len());
        framed.extend_from_slice(&message_type.to_be_bytes());
        framed.extend_from_slice(body);
        debug!(%address, message_type, len = framed.len(), "encrypted message");
        Ok(framed)
    }

    /// Decrypt a framed message from `address`.
    ///
    /// A PreKey message establishes the session and consumes the one-time
    /// pre-key it names.
    pub fn decrypt_from(
        &self,
        address: &ProtocolAddress,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TYPE_HEADER_LEN {
            return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
        }
        let (header, body) = ciphertext.split_at(TYPE_HEADER_LEN);
        let mut type_bytes = [0u8; TYPE_HEADER_LEN];
        type_bytes.copy_from_slice(header);
        let message_type = u32::from_be_bytes(type_bytes);

        let store = self.store.as_ref();
        let plaintext = store.with_session_lock(address, || {
            let ctx = StoreContext::new(store);
            let mut stores = SignalStores::new(&ctx);
            let result = match message_type {
                MESSAGE_TYPE_PREKEY => {
                    let message = PreKeySignalMessage::try_from(body)?;
                    block_on(message_decrypt_prekey(
                        &message,
                        address,
                        &mut stores.session,
                        &mut stores.identity,
                        &mut stores.prekey,
                        &mut stores.signed_prekey,
                        &mut stores.kyber,
                        &mut OsRng,
                    ))
                }
                MESSAGE_TYPE_WHISPER => {
                    let message = CiphertextMessage::SignalMessage(SignalMessage::try_from(body)?);
                    block_on(message_decrypt(
                        &message,
                        address,
                        &mut stores.session,
                        &mut stores.identity,
                        &mut stores.prekey,
                        &mut stores.signed_prekey,
                        &mut stores.kyber,
                        &mut OsRng,
                    ))
                }
                other => return Err(CryptoError::UnknownMessageType(other)),
            };
            ctx.finish(result)
        })?;

        debug!(%address, message_type, len = plaintext.len(), "decrypted message");
        Ok(plaintext)
    }
}

fn cypher_error(peer: &Identity, err: CryptoError) -> CypherError {
    match err {
        CryptoError::Signal(SignalProtocolError::SessionNotFound(..)) => {
            CypherError::NoSession(peer.clone())
        }
        CryptoError::Signal(SignalProtocolError::UntrustedIdentity(..)) => {
            CypherError::Untrusted(peer.clone())
        }
        other => CypherError::backend(other),
    }
}

impl Cypher for SignalCypher {
    fn encrypt(&self, recipient: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CypherError> {
        self.encrypt_for(&protocol_address(recipient), plaintext)
            .map_err(|e| cypher_error(recipient, e))
    }

    fn decrypt(&self, sender: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CypherError> {
        self.decrypt_from(&protocol_address(sender), ciphertext)
            .map_err(|e| cypher_error(sender, e))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::prekey::{generate_pre_keys, generate_signed_pre_key, local_bundle};
    use crate::store::{IdentityKeys, PreKeys, Sessions};

    fn address(name: &str) -> ProtocolAddress {
        ProtocolAddress::new(name.to_string(), 1.into())
    }

    /// A store with one one-time prekey (id 1) and signed prekey 1.
    fn provisioned() -> Arc<KeyStore> {
        let store = KeyStore::in_memory().unwrap();
        generate_pre_keys(&store, 0, 1).unwrap();
        generate_signed_pre_key(&store, 1).unwrap();
        Arc::new(store)
    }

    fn pin(store: &KeyStore, peer: &ProtocolAddress, other: &KeyStore) {
        store
            .save_identity(peer, other.identity_key_pair().identity_key())
            .unwrap();
    }

    #[test]
    fn establish_requires_pinned_identity() {
        let alice = provisioned();
        let bob = provisioned();
        let bundle = local_bundle(&bob, 1, Some(1), 1).unwrap();

        let err = establish_session(&alice, &address("bob"), &bundle).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::Signal(SignalProtocolError::UntrustedIdentity(..))
        ));
        assert!(!alice.contains_session(&address("bob")).unwrap());
    }

    #[test]
    fn prekey_then_whisper_exchange() {
        let alice = provisioned();
        let bob = provisioned();
        let (to_bob, to_alice) = (address("bob"), address("alice"));
        pin(&alice, &to_bob, &bob);
        pin(&bob, &to_alice, &alice);

        establish_session(&alice, &to_bob, &local_bundle(&bob, 1, Some(1), 1).unwrap()).unwrap();
        assert!(alice.contains_session(&to_bob).unwrap());

        let alice_cypher = SignalCypher::new(Arc::clone(&alice));
        let bob_cypher = SignalCypher::new(Arc::clone(&bob));

        let first = alice_cypher.encrypt_for(&to_bob, b"hello bob").unwrap();
        assert_eq!(&first[..4], &MESSAGE_TYPE_PREKEY.to_be_bytes());
        assert_eq!(bob_cypher.decrypt_from(&to_alice, &first).unwrap(), b"hello bob");
        assert!(!bob.contains_pre_key(1u32.into()).unwrap());

        let reply = bob_cypher.encrypt_for(&to_alice, b"hi alice").unwrap();
        assert_eq!(&reply[..4], &MESSAGE_TYPE_WHISPER.to_be_bytes());
        assert_eq!(alice_cypher.decrypt_from(&to_bob, &reply).unwrap(), b"hi alice");
    }

    #[test]
    fn encrypt_without_session_is_no_session() {
        let alice = SignalCypher::new(provisioned());
        let err = alice.encrypt(&Identity::new("nobody", 1), b"x").unwrap_err();
        assert!(matches!(err, CypherError::NoSession(peer) if peer.name == "nobody"));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let alice = SignalCypher::new(provisioned());
        let peer = address("bob");

        assert!(matches!(
            alice.decrypt_from(&peer, &[0, 0]),
            Err(CryptoError::CiphertextTooShort(2))
        ));
        assert!(matches!(
            alice.decrypt_from(&peer, &[0, 0, 0, 9, 1, 2, 3]),
            Err(CryptoError::UnknownMessageType(9))
        ));
        assert!(matches!(
            alice.decrypt_from(&peer, &[0, 0, 0, 2, 1, 2, 3]),
            Err(CryptoError::Signal(_))
        ));
    }

    #[test]
    fn concurrent_encrypts_all_decrypt() {
        let alice = provisioned();
        let bob = provisioned();
        let (to_bob, to_alice) = (address("bob"), address("alice"));
        pin(&alice, &to_bob, &bob);
        pin(&bob, &to_alice, &alice);
        establish_session(&alice, &to_bob, &local_bundle(&bob, 1, Some(1), 1).unwrap()).unwrap();

        let alice_cypher = SignalCypher::new(Arc::clone(&alice));
        let bob_cypher = SignalCypher::new(Arc::clone(&bob));
        let first = alice_cypher.encrypt_for(&to_bob, b"hello").unwrap();
        bob_cypher.decrypt_from(&to_alice, &first).unwrap();
        let reply = bob_cypher.encrypt_for(&to_alice, b"hi").unwrap();
        alice_cypher.decrypt_from(&to_bob, &reply).unwrap();

        let sent: Vec<(Vec<u8>, Vec<u8>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let (cypher, to_bob) = (&alice_cypher, &to_bob);
                    s.spawn(move || {
                        (0..10)
                            .map(|i| {
                                let plaintext = format!("message {t}.{i}").into_bytes();
                                let framed = cypher.encrypt_for(to_bob, &plaintext).unwrap();
                                (plaintext, framed)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(sent.len(), 80);

        // Deliver in reverse, split across threads, so Bob sees messages out of order.
        let mut received: Vec<Vec<u8>> = thread::scope(|s| {
            let handles: Vec<_> = sent
                .rchunks(10)
                .map(|chunk| {
                    let (cypher, to_alice) = (&bob_cypher, &to_alice);
                    s.spawn(move || {
                        chunk
                            .iter()
                            .map(|(plaintext, framed)| {
                                let decrypted = cypher.decrypt_from(to_alice, framed).unwrap();
                                assert_eq!(&decrypted, plaintext);
                                decrypted
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let mut expected: Vec<Vec<u8>> = sent.into_iter().map(|(p, _)| p).collect();
        received.sort();
        expected.sort();
        assert_eq!(received, expected);
    }
}
