//! Pre-key and signed pre-key generation.
//!
//! Pre-keys are one-time-use Curve25519 key pairs used in the X3DH
//! key agreement protocol. Signed pre-keys are medium-term keys
//! signed by the identity key.

use std::time::{SystemTime, UNIX_EPOCH};

use libsignal_protocol::{
    GenericSignedPreKey, IdentityKey, KeyPair, PreKeyBundle, PreKeyId, PreKeyRecord, PublicKey,
    SignedPreKeyId, SignedPreKeyRecord, Timestamp,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CryptoError, StoreError};
use crate::store::{IdentityKeys, KeyStore, PreKeys, SignedPreKeys};

/// Number of one-time pre-keys to generate initially.
pub const INITIAL_PREKEY_COUNT: u32 = 100;

/// Threshold below which we should replenish pre-keys.
pub const PREKEY_REPLENISH_THRESHOLD: u32 = 10;

/// Pre-key ids are 24-bit on the wire.
pub const MAX_PREKEY_ID: u32 = 0xFF_FFFF;

/// Map an id offset into `1..MAX_PREKEY_ID`, wrapping around.
fn wrap_pre_key_id(offset: u64) -> u32 {
    // The result is below MAX_PREKEY_ID, so the cast never truncates.
    ((offset % u64::from(MAX_PREKEY_ID - 1)) + 1) as u32
}

fn store_batch(
    store: &KeyStore,
    start: u32,
    count: u32,
) -> Result<Vec<PreKeyRecord>, CryptoError> {
    let mut records = Vec::with_capacity(count as usize);

    for i in 0..count {
        let id = PreKeyId::from(wrap_pre_key_id(u64::from(start) + u64::from(i)));
        let key_pair = KeyPair::generate(&mut OsRng);
        let record = PreKeyRecord::new(id, &key_pair);
        store.store_pre_key(id, &record)?;
        records.push(record);
    }

    Ok(records)
}

/// Generate `count` one-time pre-keys and store them.
///
/// Key `i` gets id `((start + i) % (MAX_PREKEY_ID - 1)) + 1`. The stored id
/// counter is moved to just past this batch.
pub fn generate_pre_keys(
    store: &KeyStore,
    start: u32,
    count: u32,
) -> Result<Vec<PreKeyRecord>, CryptoError> {
    let records = store_batch(store, start, count)?;
    let next = wrap_pre_key_id(u64::from(start) + u64::from(count));
    store.update_pre_key_counter(|_| Ok((next, ())))?;

    debug!(start, count, next, "generated prekeys");
    Ok(records)
}

/// Generate `count` one-time pre-keys at the ids following the last batch.
///
/// Ids are reserved from the stored counter before any key is written, so
/// concurrent callers get disjoint ranges and consumed ids are not reissued
/// until the id space wraps.
pub fn generate_next_pre_keys(
    store: &KeyStore,
    count: u32,
) -> Result<Vec<PreKeyRecord>, CryptoError> {
    let first = store.update_pre_key_counter(|current| {
        let first = match current {
            Some(id) => id,
            None => wrap_pre_key_id(u64::from(highest_pre_key_id(store)?)),
        };
        // `first` is already a wrapped id, so offset `first - 1` maps back onto it.
        let next = wrap_pre_key_id(u64::from(first - 1) + u64::from(count));
        Ok((next, first))
    })?;

    let records = store_batch(store, first - 1, count)?;
    debug!(first, count, "generated prekeys from counter");
    Ok(records)
}

/// Generate a signed pre-key under `id`, signed by the local identity key.
pub fn generate_signed_pre_key(
    store: &KeyStore,
    id: u32,
) -> Result<SignedPreKeyRecord, CryptoError> {
    let signed_prekey_id = SignedPreKeyId::from(id);
    let key_pair = KeyPair::generate(&mut OsRng);
    let timestamp_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let signature = store
        .identity_key_pair()
        .private_key()
        .calculate_signature(&key_pair.public_key.serialize(), &mut OsRng)?;

    let record = SignedPreKeyRecord::new(
        signed_prekey_id,
        Timestamp::from_epoch_millis(timestamp_millis),
        &key_pair,
        &signature,
    );
    store.store_signed_pre_key(signed_prekey_id, &record)?;

    debug!(id, "generated signed prekey");
    Ok(record)
}

/// Id the next generated pre-key takes.
///
/// Stores without a counter fall back to one past the highest stored id.
pub fn next_pre_key_id(store: &KeyStore) -> Result<u32, CryptoError> {
    match store.pre_key_counter()? {
        Some(id) => Ok(id),
        None => Ok(wrap_pre_key_id(u64::from(highest_pre_key_id(store)?))),
    }
}

fn highest_pre_key_id(store: &KeyStore) -> Result<u32, StoreError> {
    Ok(store.pre_key_ids()?.last().copied().unwrap_or(0))
}

/// Top up one-time pre-keys when fewer than `threshold` remain.
///
/// Returns the newly generated records, empty if the supply was sufficient.
pub fn replenish_pre_keys(
    store: &KeyStore,
    threshold: u32,
    batch: u32,
) -> Result<Vec<PreKeyRecord>, CryptoError> {
    let remaining = store.pre_key_ids()?.len();
    if remaining >= threshold as usize {
        return Ok(Vec::new());
    }

    let records = generate_next_pre_keys(store, batch)?;
    info!(remaining, generated = records.len(), "replenished prekeys");
    Ok(records)
}

/// Public bundle material in a transport-friendly form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub signed_prekey_public: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    #[serde(default)]
    pub one_time_prekey: Option<PublishedPreKey>,
}

/// A one-time pre-key's public portion for protocol transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
}

impl PublishedBundle {
    /// Decode into a libsignal bundle for session establishment.
    pub fn into_bundle(self) -> Result<PreKeyBundle, CryptoError> {
        let identity_key = IdentityKey::decode(&self.identity_key)?;
        let signed_prekey = PublicKey::deserialize(&self.signed_prekey_public)?;
        let prekey = self
            .one_time_prekey
            .map(|p| {
                PublicKey::deserialize(&p.public_key).map(|key| (PreKeyId::from(p.id), key))
            })
            .transpose()?;

        Ok(PreKeyBundle::new(
            self.registration_id,
            self.device_id.into(),
            prekey,
            SignedPreKeyId::from(self.signed_prekey_id),
            signed_prekey,
            self.signed_prekey_signature,
            identity_key,
        )?)
    }
}

/// Collect this installation's public bundle from stored records.
pub fn published_bundle(
    store: &KeyStore,
    device_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
) -> Result<PublishedBundle, CryptoError> {
    let signed = store.load_signed_pre_key(SignedPreKeyId::from(signed_pre_key_id))?;
    let one_time_prekey = match pre_key_id {
        Some(id) => {
            let record = store.load_pre_key(PreKeyId::from(id))?;
            Some(PublishedPreKey {
                id,
                public_key: record.public_key()?.serialize().to_vec(),
            })
        }
        None => None,
    };

    Ok(PublishedBundle {
        registration_id: store.local_registration_id(),
        device_id,
        identity_key: store.identity_key_pair().identity_key().serialize().to_vec(),
        signed_prekey_id: signed_pre_key_id,
        signed_prekey_public: signed.public_key()?.serialize().to_vec(),
        signed_prekey_signature: signed.signature()?.to_vec(),
        one_time_prekey,
    })
}

/// This installation's pre-key bundle, as a peer would receive it.
pub fn local_bundle(
    store: &KeyStore,
    device_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: u32,
) -> Result<PreKeyBundle, CryptoError> {
    published_bundle(store, device_id, pre_key_id, signed_pre_key_id)?.into_bundle()
}
