//! libsignal store trait implementations backed by a [`KeyStore`].
//!
//! libsignal's session functions take each store as a separate `&mut`, so
//! every facet gets its own thin adapter over a shared [`StoreContext`]. The
//! context remembers the first [`StoreError`] an adapter hit, so callers can
//! report the real storage failure instead of libsignal's flattened error.

use std::cell::RefCell;

use libsignal_protocol::{
    Direction, IdentityKey, IdentityKeyPair, IdentityKeyStore, KyberPreKeyId, KyberPreKeyRecord,
    KyberPreKeyStore, PreKeyId, PreKeyRecord, PreKeyStore, ProtocolAddress, SessionRecord,
    SessionStore, SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
};

use crate::error::{CryptoError, KeyNamespace, StoreError};
use crate::store::{IdentityKeys, KeyStore, PreKeys, SignedPreKeys};

pub(crate) struct StoreContext<'a> {
    store: &'a KeyStore,
    failure: RefCell<Option<StoreError>>,
}

impl<'a> StoreContext<'a> {
    pub(crate) fn new(store: &'a KeyStore) -> Self {
        Self {
            store,
            failure: RefCell::new(None),
        }
    }

    fn record<T>(&self, result: Result<T, StoreError>) -> Result<T, SignalProtocolError> {
        result.map_err(|err| {
            let flattened = match &err {
                StoreError::InvalidKeyId {
                    namespace: KeyNamespace::PreKey,
                    ..
                } => SignalProtocolError::InvalidPreKeyId,
                StoreError::InvalidKeyId {
                    namespace: KeyNamespace::SignedPreKey,
                    ..
                } => SignalProtocolError::InvalidSignedPreKeyId,
                other => SignalProtocolError::InvalidArgument(format!("key store: {other}")),
            };
            self.failure.borrow_mut().get_or_insert(err);
            flattened
        })
    }

    /// Convert a libsignal result, preferring the store failure behind it.
    pub(crate) fn finish<T>(&self, result: Result<T, SignalProtocolError>) -> Result<T, CryptoError> {
        result.map_err(|err| match self.failure.borrow_mut().take() {
            Some(store_err) => CryptoError::Store(store_err),
            None => CryptoError::Signal(err),
        })
    }
}

/// All libsignal stores for one operation, borrowing one context.
pub(crate) struct SignalStores<'a> {
    pub identity: CollarIdentityStore<'a>,
    pub prekey: CollarPreKeyStore<'a>,
    pub signed_prekey: CollarSignedPreKeyStore<'a>,
    pub session: CollarSessionStore<'a>,
    pub kyber: CollarKyberPreKeyStore,
}

impl<'a> SignalStores<'a> {
    pub(crate) fn new(ctx: &'a StoreContext<'a>) -> Self {
        Self {
            identity: CollarIdentityStore { ctx },
            prekey: CollarPreKeyStore { ctx },
            signed_prekey: CollarSignedPreKeyStore { ctx },
            session: CollarSessionStore { ctx },
            kyber: CollarKyberPreKeyStore,
        }
    }
}

// ── Identity Key Store ──────────────────────────────────────────────────

pub(crate) struct CollarIdentityStore<'a> {
    ctx: &'a StoreContext<'a>,
}

#[async_trait::async_trait(?Send)]
impl<'a> IdentityKeyStore for CollarIdentityStore<'a> {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        Ok(IdentityKeys::identity_key_pair(self.ctx.store))
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        Ok(IdentityKeys::local_registration_id(self.ctx.store))
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SignalProtocolError> {
        // libsignal only saves after is_trusted_identity passed, so under the
        // closed trust policy this re-pins the key that is already pinned.
        self.ctx
            .record(IdentityKeys::save_identity(self.ctx.store, address, identity))
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        self.ctx
            .record(IdentityKeys::is_trusted_identity(self.ctx.store, address, identity))
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        self.ctx
            .record(IdentityKeys::identity(self.ctx.store, address))
    }
}

// ── Kyber Pre-Key Store ────────────────────────────────────────────────
// Collar bundles carry no Kyber keys, but the decrypt functions require a
// KyberPreKeyStore. Nothing is ever stored here.

pub(crate) struct CollarKyberPreKeyStore;

#[async_trait::async_trait(?Send)]
impl KyberPreKeyStore for CollarKyberPreKeyStore {
    async fn get_kyber_pre_key(
        &self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        Err(SignalProtocolError::InvalidKyberPreKeyId)
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }
}

// ── Pre-Key Store ───────────────────────────────────────────────────────

pub(crate) struct CollarPreKeyStore<'a> {
    ctx: &'a StoreContext<'a>,
}

#[async_trait::async_trait(?Send)]
impl<'a> PreKeyStore for CollarPreKeyStore<'a> {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        self.ctx.record(PreKeys::load_pre_key(self.ctx.store, id))
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.ctx
            .record(PreKeys::store_pre_key(self.ctx.store, id, record))
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        self.ctx.record(PreKeys::remove_pre_key(self.ctx.store, id))
    }
}

// ── Signed Pre-Key Store ────────────────────────────────────────────────

pub(crate) struct CollarSignedPreKeyStore<'a> {
    ctx: &'a StoreContext<'a>,
}

#[async_trait::async_trait(?Send)]
impl<'a> SignedPreKeyStore for CollarSignedPreKeyStore<'a> {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        self.ctx
            .record(SignedPreKeys::load_signed_pre_key(self.ctx.store, id))
    }

    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.ctx
            .record(SignedPreKeys::store_signed_pre_key(self.ctx.store, id, record))
    }
}

// ── Session Store ───────────────────────────────────────────────────────
// Only used while the caller holds the session lock for the address.

pub(crate) struct CollarSessionStore<'a> {
    ctx: &'a StoreContext<'a>,
}

#[async_trait::async_trait(?Send)]
impl<'a> SessionStore for CollarSessionStore<'a> {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        self.ctx
            .record(self.ctx.store.read_session_unlocked(address))
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        self.ctx
            .record(self.ctx.store.write_session_unlocked(address, record))
    }
}
