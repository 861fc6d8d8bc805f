//! Persistent Signal Protocol key store.
//!
//! The store is split into narrow facets ([`IdentityKeys`], [`PreKeys`],
//! [`SignedPreKeys`], [`Sessions`]) that [`KeyStore`] implements over a single
//! [`RecordStorage`] handle. Record bytes are whatever libsignal serializes;
//! this layer never looks inside them.
//!
//! Every operation runs under a per-record lock, so reads and writes of one
//! prekey id or one peer address are linearizable while unrelated records
//! proceed in parallel.

mod file;
mod locks;
mod record;
mod storage;

use libsignal_protocol::{
    IdentityKey, IdentityKeyPair, PreKeyId, PreKeyRecord, ProtocolAddress, SessionRecord,
    SignedPreKeyId, SignedPreKeyRecord,
};
use tracing::{debug, info};

pub use file::FileStorage;
pub use locks::RecordLocks;
pub use record::{AddressKind, RecordKey};
pub use storage::{MemoryStorage, RecordStorage};

use crate::error::{KeyNamespace, StoreError};
use crate::identity::{
    generate_identity_key_pair, generate_registration_id, SerializableIdentityKeyPair,
};
use crate::scope::ScopeResolver;

/// Local identity material and pinned peer identities.
pub trait IdentityKeys {
    fn identity_key_pair(&self) -> IdentityKeyPair;

    fn local_registration_id(&self) -> u32;

    /// Pin `identity` as trusted for `address`, replacing any earlier pin.
    /// Returns true if a different key was pinned before.
    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError>;

    /// True only if `identity` matches the key pinned for `address`.
    /// Addresses with no pin are untrusted.
    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError>;

    fn identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, StoreError>;
}

/// One-time prekeys.
pub trait PreKeys {
    fn load_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, StoreError>;

    fn store_pre_key(&self, id: PreKeyId, record: &PreKeyRecord) -> Result<(), StoreError>;

    fn contains_pre_key(&self, id: PreKeyId) -> Result<bool, StoreError>;

    fn remove_pre_key(&self, id: PreKeyId) -> Result<(), StoreError>;

    fn pre_key_ids(&self) -> Result<Vec<u32>, StoreError>;
}

/// Signed prekeys. Ids live in their own namespace.
pub trait SignedPreKeys {
    fn load_signed_pre_key(&self, id: SignedPreKeyId) -> Result<SignedPreKeyRecord, StoreError>;

    fn store_signed_pre_key(
        &self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError>;

    fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool, StoreError>;

    fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> Result<(), StoreError>;

    fn signed_pre_key_ids(&self) -> Result<Vec<u32>, StoreError>;
}

/// Per-peer-device session state.
pub trait Sessions {
    /// The stored session, or a fresh one (not persisted) if none exists.
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord, StoreError>;

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, StoreError>;

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;

    fn delete_session(&self, address: &ProtocolAddress) -> Result<(), StoreError>;

    /// Delete the sessions of every device registered under `name`.
    fn delete_all_sessions(&self, name: &str) -> Result<(), StoreError>;

    /// Device ids with a stored session under `name`, ascending.
    fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>, StoreError>;
}

/// Durable key store for one server scope.
pub struct KeyStore {
    storage: Box<dyn RecordStorage>,
    locks: RecordLocks,
    identity_key_pair: IdentityKeyPair,
    registration_id: u32,
}

impl KeyStore {
    /// Open a store over `storage`, generating identity material on first use.
    pub fn open<S: RecordStorage + 'static>(storage: S) -> Result<Self, StoreError> {
        let storage: Box<dyn RecordStorage> = Box::new(storage);
        let (identity_key_pair, registration_id) = load_or_create_identity(storage.as_ref())?;
        Ok(Self {
            storage,
            locks: RecordLocks::new(),
            identity_key_pair,
            registration_id,
        })
    }

    /// Open the file-backed store for `server` under `resolver`'s root.
    pub fn open_scoped(resolver: &impl ScopeResolver, server: &str) -> Result<Self, StoreError> {
        let root = resolver.resolve(server)?;
        info!(server, root = %root.display(), "opening key store");
        Self::open(FileStorage::open(root)?)
    }

    /// A store that lives only as long as this value.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(MemoryStorage::new())
    }

    /// Run `f` while holding the session lock for `address`.
    ///
    /// Session reads and writes for `address` inside `f` must go through the
    /// crate's unlocked accessors; calling [`Sessions`] methods for the same
    /// address from `f` deadlocks.
    pub fn with_session_lock<R>(&self, address: &ProtocolAddress, f: impl FnOnce() -> R) -> R {
        self.locks.with(&RecordKey::session(address), f)
    }

    pub(crate) fn read_session_unlocked(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let key = RecordKey::session(address);
        self.read(&key, |bytes| SessionRecord::deserialize(bytes))
    }

    pub(crate) fn write_session_unlocked(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        self.storage
            .save(&RecordKey::session(address), &record.serialize()?)
    }

    /// The stored prekey id counter, if one has been written.
    pub fn pre_key_counter(&self) -> Result<Option<u32>, StoreError> {
        let key = RecordKey::NextPreKeyId;
        self.locks.with(&key, || self.read(&key, decode_counter))
    }

    /// Read and replace the prekey id counter as one step under its lock.
    ///
    /// `advance` gets the stored value and returns the value to store next,
    /// plus a result handed back to the caller.
    pub fn update_pre_key_counter<R>(
        &self,
        advance: impl FnOnce(Option<u32>) -> Result<(u32, R), StoreError>,
    ) -> Result<R, StoreError> {
        let key = RecordKey::NextPreKeyId;
        self.locks.with(&key, || {
            let current = self.read(&key, decode_counter)?;
            let (next, result) = advance(current)?;
            self.storage.save(&key, &next.to_be_bytes())?;
            Ok(result)
        })
    }

    /// Load and decode one record; undecodable bytes are corruption.
    fn read<T, E, F>(&self, key: &RecordKey, decode: F) -> Result<Option<T>, StoreError>
    where
        E: std::fmt::Display,
        F: FnOnce(&[u8]) -> Result<T, E>,
    {
        match self.storage.load(key)? {
            None => Ok(None),
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(key, e)),
        }
    }

    fn load_key_record<T, E, F>(
        &self,
        namespace: KeyNamespace,
        id: u32,
        decode: F,
    ) -> Result<T, StoreError>
    where
        E: std::fmt::Display,
        F: FnOnce(&[u8]) -> Result<T, E>,
    {
        let key = RecordKey::key_id(namespace, id);
        self.locks
            .with(&key, || self.read(&key, decode))?
            .ok_or(StoreError::InvalidKeyId { namespace, id })
    }

    fn store_key_record(
        &self,
        namespace: KeyNamespace,
        id: u32,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let key = RecordKey::key_id(namespace, id);
        self.locks.with(&key, || self.storage.save(&key, bytes))
    }

    fn contains_key(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.locks.with(key, || self.storage.contains(key))
    }

    fn remove_key(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.locks.with(key, || self.storage.remove(key))
    }
}

/// Load the singleton identity records, or create them if this is a new store.
///
/// The registration id is written first and the key pair last, so a store
/// without a key pair never handed out identity material and is safe to
/// initialise again.
fn load_or_create_identity(
    storage: &dyn RecordStorage,
) -> Result<(IdentityKeyPair, u32), StoreError> {
    let pair = storage.load(&RecordKey::IdentityKeyPair)?;
    let registration = storage.load(&RecordKey::RegistrationId)?;

    match (pair, registration) {
        (Some(pair), Some(registration)) => {
            let identity_key_pair = decode_identity_key_pair(&pair)?;
            let registration_id = decode_registration_id(&registration)?;
            debug!(registration_id, "loaded identity");
            Ok((identity_key_pair, registration_id))
        }
        (Some(_), None) => Err(StoreError::Uninitialised("registration id")),
        (None, _) => {
            let identity_key_pair = generate_identity_key_pair();
            let registration_id = generate_registration_id();

            let serializable = SerializableIdentityKeyPair::from_identity_key_pair(&identity_key_pair);
            let encoded = postcard::to_allocvec(&serializable)
                .map_err(|e| StoreError::corrupt(RecordKey::IdentityKeyPair, e))?;

            storage.save(&RecordKey::RegistrationId, &registration_id.to_be_bytes())?;
            storage.save(&RecordKey::IdentityKeyPair, &encoded)?;
            info!(registration_id, "generated new identity");
            Ok((identity_key_pair, registration_id))
        }
    }
}

fn decode_identity_key_pair(bytes: &[u8]) -> Result<IdentityKeyPair, StoreError> {
    let serializable: SerializableIdentityKeyPair = postcard::from_bytes(bytes)
        .map_err(|e| StoreError::corrupt(RecordKey::IdentityKeyPair, e))?;
    serializable
        .to_identity_key_pair()
        .map_err(|e| StoreError::corrupt(RecordKey::IdentityKeyPair, e))
}

fn decode_registration_id(bytes: &[u8]) -> Result<u32, StoreError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StoreError::corrupt(RecordKey::RegistrationId, "expected 4 bytes"))?;
    match u32::from_be_bytes(raw) {
        0 => Err(StoreError::corrupt(RecordKey::RegistrationId, "registration id is zero")),
        id => Ok(id),
    }
}

fn decode_counter(bytes: &[u8]) -> Result<u32, &'static str> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| "expected 4 bytes")?;
    match u32::from_be_bytes(raw) {
        0 => Err("prekey id counter is zero"),
        id => Ok(id),
    }
}

impl IdentityKeys for KeyStore {
    fn identity_key_pair(&self) -> IdentityKeyPair {
        self.identity_key_pair.clone()
    }

    fn local_registration_id(&self) -> u32 {
        self.registration_id
    }

    fn save_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError> {
        let key = RecordKey::trusted_identity(address);
        let serialized = identity.serialize();
        self.locks.with(&key, || {
            let previous = self.storage.load(&key)?;
            self.storage.save(&key, &serialized)?;
            let changed = previous.is_some_and(|old| *old != *serialized);
            debug!(%address, changed, "pinned identity");
            Ok(changed)
        })
    }

    fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError> {
        let key = RecordKey::trusted_identity(address);
        let pinned = self.locks.with(&key, || self.storage.load(&key))?;
        Ok(pinned.is_some_and(|stored| *stored == *identity.serialize()))
    }

    fn identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityKey>, StoreError> {
        let key = RecordKey::trusted_identity(address);
        self.locks
            .with(&key, || self.read(&key, |bytes| IdentityKey::decode(bytes)))
    }
}

impl PreKeys for KeyStore {
    fn load_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, StoreError> {
        self.load_key_record(KeyNamespace::PreKey, id.into(), |bytes| {
            PreKeyRecord::deserialize(bytes)
        })
    }

    fn store_pre_key(&self, id: PreKeyId, record: &PreKeyRecord) -> Result<(), StoreError> {
        self.store_key_record(KeyNamespace::PreKey, id.into(), &record.serialize()?)
    }

    fn contains_pre_key(&self, id: PreKeyId) -> Result<bool, StoreError> {
        self.contains_key(&RecordKey::PreKey(id.into()))
    }

    fn remove_pre_key(&self, id: PreKeyId) -> Result<(), StoreError> {
        debug!(id = u32::from(id), "removing prekey");
        self.remove_key(&RecordKey::PreKey(id.into()))
    }

    fn pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.storage.list_ids(KeyNamespace::PreKey)
    }
}

impl SignedPreKeys for KeyStore {
    fn load_signed_pre_key(&self, id: SignedPreKeyId) -> Result<SignedPreKeyRecord, StoreError> {
        self.load_key_record(KeyNamespace::SignedPreKey, id.into(), |bytes| {
            SignedPreKeyRecord::deserialize(bytes)
        })
    }

    fn store_signed_pre_key(
        &self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        self.store_key_record(KeyNamespace::SignedPreKey, id.into(), &record.serialize()?)
    }

    fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> Result<bool, StoreError> {
        self.contains_key(&RecordKey::SignedPreKey(id.into()))
    }

    fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> Result<(), StoreError> {
        debug!(id = u32::from(id), "removing signed prekey");
        self.remove_key(&RecordKey::SignedPreKey(id.into()))
    }

    fn signed_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.storage.list_ids(KeyNamespace::SignedPreKey)
    }
}

impl Sessions for KeyStore {
    fn load_session(&self, address: &ProtocolAddress) -> Result<SessionRecord, StoreError> {
        let stored = self.with_session_lock(address, || self.read_session_unlocked(address))?;
        Ok(stored.unwrap_or_else(SessionRecord::new_fresh))
    }

    fn contains_session(&self, address: &ProtocolAddress) -> Result<bool, StoreError> {
        self.contains_key(&RecordKey::session(address))
    }

    fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        self.with_session_lock(address, || self.write_session_unlocked(address, record))
    }

    fn delete_session(&self, address: &ProtocolAddress) -> Result<(), StoreError> {
        self.remove_key(&RecordKey::session(address))
    }

    fn delete_all_sessions(&self, name: &str) -> Result<(), StoreError> {
        let devices = self.storage.list_devices(AddressKind::Session, name)?;
        for device_id in &devices {
            self.remove_key(&RecordKey::address(AddressKind::Session, name, *device_id))?;
        }
        debug!(name, devices = devices.len(), "deleted all sessions");
        Ok(())
    }

    fn sub_device_sessions(&self, name: &str) -> Result<Vec<u32>, StoreError> {
        self.storage.list_devices(AddressKind::Session, name)
    }
}
